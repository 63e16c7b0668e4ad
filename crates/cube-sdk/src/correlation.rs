//! 请求/响应关联
//!
//! 调用方先 `open()` 得到已登记的令牌，再发送请求，最后在令牌上等待。
//! 登记一定先于发送，快速响应不会在调用方开始等待之前丢失。
//!
//! ```text
//! 调用方: open → 登记 pending[id] → send(_notifier={id}) → wait(deadline)
//! 分发器: 收到 _notifier.id → pending.remove(id) → oneshot 投递
//! 超时:   wait 到期 → pending.remove(id)（显式驱逐，不留下泄漏条目）
//! 取消:   令牌被丢弃 → pending.remove(id)
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::action::Action;
use crate::dialect::ActionDialect;
use crate::error::{CubeError, Result};
use crate::transport::DialectTransport;

/// 关联令牌：一次性等待某个异步响应的句柄
///
/// 令牌丢弃时从待决表驱逐自己的条目；已投递的条目此时已不在表中。
#[derive(Debug)]
pub struct CorrelationToken {
    id: u64,
    action: String,
    receiver: oneshot::Receiver<ActionDialect>,
    pending: Arc<PendingTable>,
}

impl CorrelationToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

impl Drop for CorrelationToken {
    fn drop(&mut self) {
        if self.pending.evict(self.id) {
            debug!("关联 {} 在投递前被放弃，条目已驱逐: action={}", self.id, self.action);
        }
    }
}

/// 待决请求表：关联 ID → 一次性响应通道
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<u64, oneshot::Sender<ActionDialect>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以生成器分配一个未被占用的 ID 并登记；分配与登记在同一把锁内完成
    fn register_fresh(&self, mut next_id: impl FnMut() -> u64, sender: oneshot::Sender<ActionDialect>) -> u64 {
        let mut entries = self.entries.lock();
        let mut id = next_id();
        // 计数器回绕后才可能撞上仍在等待的旧 ID
        while entries.contains_key(&id) {
            id = next_id();
        }
        entries.insert(id, sender);
        id
    }

    /// 投递响应：移除条目并唤醒等待方
    ///
    /// 条目不存在（已投递或已超时驱逐）时返回 false，响应被丢弃。
    pub fn resolve(&self, id: u64, response: ActionDialect) -> bool {
        let sender = self.entries.lock().remove(&id);
        match sender {
            Some(sender) => {
                if sender.send(response).is_err() {
                    // 等待方已放弃（超时与投递交错）
                    debug!("关联 {} 的等待方已离开，响应丢弃", id);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// 驱逐条目（超时或发送失败）
    pub fn evict(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// 关联调用器：在传输层 `send` 之上提供“发送并等待”
pub struct Correlator {
    transport: Arc<dyn DialectTransport>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Correlator {
    pub fn new(transport: Arc<dyn DialectTransport>, pending: Arc<PendingTable>, timeout: Duration) -> Self {
        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// 统一的关联超时
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 创建令牌并登记到待决表
    pub fn open(&self, action: &str) -> CorrelationToken {
        let (sender, receiver) = oneshot::channel();
        let id = self
            .pending
            .register_fresh(|| self.next_id.fetch_add(1, Ordering::Relaxed), sender);
        CorrelationToken {
            id,
            action: action.to_string(),
            receiver,
            pending: self.pending.clone(),
        }
    }

    /// 嵌入关联 ID 并发送；发送失败时驱逐条目
    pub async fn send(&self, token: &CorrelationToken, mut dialect: ActionDialect) -> Result<()> {
        dialect.set_notifier(token.id);
        debug!("📤 发送关联请求: action={}, id={}", dialect.name, token.id);
        if let Err(e) = self.transport.send(dialect).await {
            self.pending.evict(token.id);
            return Err(e);
        }
        Ok(())
    }

    /// 在令牌上等待，直到被分发器投递或截止时间到达
    pub async fn wait(&self, mut token: CorrelationToken, deadline: Duration) -> Result<ActionDialect> {
        let started = Instant::now();
        let id = token.id;
        match tokio::time::timeout(deadline, &mut token.receiver).await {
            Ok(Ok(response)) => {
                debug!("📥 收到关联响应: action={}, id={}, elapsed={:?}", token.action, id, started.elapsed());
                Ok(response)
            }
            Ok(Err(_)) => {
                // 发送端在未投递的情况下被丢弃，只可能是条目被驱逐
                Err(CubeError::Transport(format!("关联 {} 已被取消: action={}", id, token.action)))
            }
            Err(_) => {
                self.pending.evict(id);
                warn!("⏱️ 关联请求超时: action={}, id={}, deadline={:?}", token.action, id, deadline);
                Err(CubeError::Timeout {
                    action: token.action.clone(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// 关联调用：未连接时立即失败，不产生任何线上流量
    pub async fn call(&self, action: Action) -> Result<ActionDialect> {
        self.call_with_timeout(action, self.timeout).await
    }

    pub async fn call_with_timeout(&self, action: Action, deadline: Duration) -> Result<ActionDialect> {
        if !self.transport.is_connected() {
            return Err(CubeError::NotConnected);
        }
        let dialect = action.into_dialect()?;
        let token = self.open(&dialect.name);
        self.send(&token, dialect).await?;
        self.wait(token, deadline).await
    }

    /// 单向发送（不登记、不等待）
    pub async fn notify(&self, action: Action) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(CubeError::NotConnected);
        }
        let dialect = action.into_dialect()?;
        debug!("📤 发送单向请求: action={}", dialect.name);
        self.transport.send(dialect).await
    }
}
