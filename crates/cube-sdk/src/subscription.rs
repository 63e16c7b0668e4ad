//! 推送事件订阅表
//!
//! 每个事件类别一张表：`(实体 ID, 域) → 监听器`，同一键最多一个监听器。
//! 表中保存 `Arc` 引用，分发时在读锁内克隆后再调用，
//! 并发替换只会让正在进行的分发看到完整的旧监听器或新监听器。

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::entity::{Contact, Device, Message};
use crate::error::{CubeError, Result};

/// 消息监听器
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &Message);
}

impl<F> MessageListener for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_message(&self, message: &Message) {
        self(message)
    }
}

/// 联系人事件监听器（签入、签出、设备超时）
pub trait ContactEventListener: Send + Sync {
    fn on_sign_in(&self, _contact: &Contact, _device: &Device) {}

    fn on_sign_out(&self, _contact: &Contact, _device: &Device) {}

    fn on_device_timeout(&self, _contact: &Contact, _device: &Device) {}
}

/// 事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    MessageReceived,
    MessageSent,
    Contact,
}

impl EventClass {
    /// 向服务端登记时使用的事件名
    pub fn remote_event(&self) -> &'static str {
        match self {
            EventClass::MessageReceived | EventClass::MessageSent => "Message",
            EventClass::Contact => "Contact",
        }
    }
}

type ScopeKey = (u64, String);

/// 单一类别的监听器表
pub struct ListenerMap<L: ?Sized> {
    entries: RwLock<HashMap<ScopeKey, Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerMap<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<L: ?Sized> ListenerMap<L> {
    /// 登记监听器，返回被替换的旧监听器
    pub fn register(&self, entity_id: u64, domain: &str, listener: Arc<L>) -> Option<Arc<L>> {
        self.entries
            .write()
            .insert((entity_id, domain.to_string()), listener)
    }

    pub fn remove(&self, entity_id: u64, domain: &str) -> Option<Arc<L>> {
        self.entries.write().remove(&(entity_id, domain.to_string()))
    }

    /// 取出当前监听器的引用
    pub fn get(&self, entity_id: u64, domain: &str) -> Option<Arc<L>> {
        self.entries
            .read()
            .get(&(entity_id, domain.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// 服务端登记键：(远端事件名, 实体 ID, 域)
type RemoteKey = (&'static str, u64, String);

/// 登记结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// 该键此前已有同类监听器
    pub replaced: bool,
    /// 该远端键尚未向服务端登记，调用方需发送 `AddEventListener`
    pub needs_remote: bool,
}

/// 移除结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removal {
    pub removed: bool,
    /// 远端键已无监听器且曾经登记，调用方需发送 `RemoveEventListener`
    pub release_remote: bool,
}

/// 事件订阅表
///
/// `remote` 记录已向服务端登记的键。本地表的增删与远端登记状态的判定
/// 在同一把 `remote` 锁内完成，并发登记只会有一方拿到 `needs_remote`。
#[derive(Default)]
pub struct EventSubscriptions {
    received: ListenerMap<dyn MessageListener>,
    sent: ListenerMap<dyn MessageListener>,
    contact: ListenerMap<dyn ContactEventListener>,
    remote: Mutex<HashSet<RemoteKey>>,
}

impl EventSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn message_map(&self, class: EventClass) -> Result<&ListenerMap<dyn MessageListener>> {
        match class {
            EventClass::MessageReceived => Ok(&self.received),
            EventClass::MessageSent => Ok(&self.sent),
            EventClass::Contact => Err(CubeError::InvalidArgument(
                "联系人事件需通过 add_contact_listener 登记".to_string(),
            )),
        }
    }

    /// 登记消息监听器
    ///
    /// 接收与发送两类共用一个远端键。`EventClass::Contact` 返回 `InvalidArgument`。
    pub fn add_message_listener(
        &self,
        class: EventClass,
        entity_id: u64,
        domain: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Registration> {
        let map = self.message_map(class)?;
        let mut remote = self.remote.lock();
        let replaced = map.register(entity_id, domain, listener).is_some();
        let needs_remote = remote.insert((class.remote_event(), entity_id, domain.to_string()));
        info!(
            "登记消息监听器: class={:?}, entity={}, domain={}, replaced={}, needs_remote={}",
            class, entity_id, domain, replaced, needs_remote
        );
        Ok(Registration { replaced, needs_remote })
    }

    /// 移除消息监听器；接收与发送两类都已为空时释放远端键
    pub fn remove_message_listener(&self, class: EventClass, entity_id: u64, domain: &str) -> Result<Removal> {
        let map = self.message_map(class)?;
        let mut remote = self.remote.lock();
        if map.remove(entity_id, domain).is_none() {
            return Ok(Removal::default());
        }
        let remaining = self.received.get(entity_id, domain).is_some() || self.sent.get(entity_id, domain).is_some();
        let release_remote = !remaining && remote.remove(&(class.remote_event(), entity_id, domain.to_string()));
        Ok(Removal {
            removed: true,
            release_remote,
        })
    }

    pub fn add_contact_listener(
        &self,
        contact_id: u64,
        domain: &str,
        listener: Arc<dyn ContactEventListener>,
    ) -> Registration {
        let mut remote = self.remote.lock();
        let replaced = self.contact.register(contact_id, domain, listener).is_some();
        let needs_remote = remote.insert((EventClass::Contact.remote_event(), contact_id, domain.to_string()));
        info!(
            "登记联系人事件监听器: contact={}, domain={}, replaced={}, needs_remote={}",
            contact_id, domain, replaced, needs_remote
        );
        Registration { replaced, needs_remote }
    }

    pub fn remove_contact_listener(&self, contact_id: u64, domain: &str) -> Removal {
        let mut remote = self.remote.lock();
        if self.contact.remove(contact_id, domain).is_none() {
            return Removal::default();
        }
        Removal {
            removed: true,
            release_remote: remote.remove(&(EventClass::Contact.remote_event(), contact_id, domain.to_string())),
        }
    }

    /// 服务端登记未能发出时撤销远端标记，下一次登记会重新发送
    pub fn release_remote(&self, class: EventClass, entity_id: u64, domain: &str) {
        if self
            .remote
            .lock()
            .remove(&(class.remote_event(), entity_id, domain.to_string()))
        {
            warn!(
                "撤销远端登记标记: event={}, entity={}, domain={}",
                class.remote_event(),
                entity_id,
                domain
            );
        }
    }

    /// 远端键是否已登记
    pub fn is_remote_registered(&self, class: EventClass, entity_id: u64, domain: &str) -> bool {
        self.remote
            .lock()
            .contains(&(class.remote_event(), entity_id, domain.to_string()))
    }

    pub fn received_listener(&self, entity_id: u64, domain: &str) -> Option<Arc<dyn MessageListener>> {
        self.received.get(entity_id, domain)
    }

    pub fn sent_listener(&self, entity_id: u64, domain: &str) -> Option<Arc<dyn MessageListener>> {
        self.sent.get(entity_id, domain)
    }

    pub fn contact_listener(&self, contact_id: u64, domain: &str) -> Option<Arc<dyn ContactEventListener>> {
        self.contact.get(contact_id, domain)
    }

    /// 全部类别的监听器数量
    pub fn listener_count(&self) -> usize {
        self.received.len() + self.sent.len() + self.contact.len()
    }
}
