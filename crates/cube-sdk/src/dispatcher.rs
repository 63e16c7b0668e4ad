//! 入站分发器
//!
//! 传输层投递的所有入站方言都经过这里：
//! - 带 `_notifier` 的是关联响应，交给待决表投递给等待方；
//! - 其余是推送事件，按事件名解析后路由到订阅表中对应作用域的监听器。
//!
//! 监听器在分发路径上同步执行，慢监听器会拖住后续所有入站处理。

use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::correlation::PendingTable;
use crate::dialect::{ActionDialect, EVENT_KEY};
use crate::entity::{Contact, Device, Message};
use crate::subscription::EventSubscriptions;
use crate::transport::InboundListener;

/// 推送事件
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
pub enum PushEvent {
    SignIn { contact: Contact, device: Device },
    SignOut { contact: Contact, device: Device },
    DeviceTimeout { contact: Contact, device: Device },
    Message { message: Message },
}

impl PushEvent {
    /// 从非关联方言解析；事件名取 `params.event`，缺省时用动作名
    pub fn from_dialect(dialect: &ActionDialect) -> Result<Self, serde_json::Error> {
        let mut params = dialect.params.clone();
        if !params.contains_key(EVENT_KEY) {
            params.insert(EVENT_KEY.to_string(), Value::String(dialect.name.clone()));
        }
        serde_json::from_value(Value::Object(params))
    }
}

/// 分发统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub responses_delivered: u64,
    pub responses_dropped: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
}

/// 入站分发器
pub struct InboundDispatcher {
    pending: Arc<PendingTable>,
    subscriptions: Arc<EventSubscriptions>,
    responses_delivered: AtomicU64,
    responses_dropped: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
}

impl InboundDispatcher {
    pub fn new(pending: Arc<PendingTable>, subscriptions: Arc<EventSubscriptions>) -> Self {
        Self {
            pending,
            subscriptions,
            responses_delivered: AtomicU64::new(0),
            responses_dropped: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }

    fn dispatch_response(&self, dialect: ActionDialect) {
        let Some(id) = dialect.notifier_id() else {
            warn!("关联对象缺少有效 ID，丢弃响应: action={}", dialect.name);
            self.responses_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let action = dialect.name.clone();
        if self.pending.resolve(id, dialect) {
            debug!("关联响应已投递: action={}, id={}", action, id);
            self.responses_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            // 已超时驱逐或重复投递
            warn!("未找到待决请求，丢弃响应: action={}, id={}", action, id);
            self.responses_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dispatch_event(&self, dialect: ActionDialect) {
        let event = match PushEvent::from_dialect(&dialect) {
            Ok(event) => event,
            Err(e) => {
                warn!("无法识别的推送事件，丢弃: event={}, error={}", dialect.event_name(), e);
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if self.route(&event) {
            self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("推送事件无订阅者: {:?}", event);
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 路由到监听器；至少一个监听器收到时返回 true
    fn route(&self, event: &PushEvent) -> bool {
        match event {
            PushEvent::Message { message } => {
                let mut delivered = false;
                // 接收方作用域：群组消息按群组，否则按收件人
                let scope = if message.is_group() { message.source } else { message.to };
                if let Some(listener) = self.subscriptions.received_listener(scope, &message.domain) {
                    listener.on_message(message);
                    delivered = true;
                }
                if let Some(listener) = self.subscriptions.sent_listener(message.from, &message.domain) {
                    listener.on_message(message);
                    delivered = true;
                }
                delivered
            }
            PushEvent::SignIn { contact, device } => self.route_contact(contact, |l| l.on_sign_in(contact, device)),
            PushEvent::SignOut { contact, device } => self.route_contact(contact, |l| l.on_sign_out(contact, device)),
            PushEvent::DeviceTimeout { contact, device } => {
                self.route_contact(contact, |l| l.on_device_timeout(contact, device))
            }
        }
    }

    fn route_contact<F>(&self, contact: &Contact, invoke: F) -> bool
    where
        F: FnOnce(&dyn crate::subscription::ContactEventListener),
    {
        match self.subscriptions.contact_listener(contact.id, &contact.domain) {
            Some(listener) => {
                invoke(listener.as_ref());
                true
            }
            None => false,
        }
    }
}

impl InboundListener for InboundDispatcher {
    fn on_dialect(&self, dialect: ActionDialect) {
        if dialect.is_correlated() {
            self.dispatch_response(dialect);
        } else {
            self.dispatch_event(dialect);
        }
    }
}
