//! 时间窗口历史遍历
//!
//! 以固定步长把 `[beginning, terminal)` 切成连续窗口，逐窗口向服务端查询，
//! 空窗口自动跳过。`terminal` 在构造时取当前时间，之后不再前移；
//! 遍历为单次前向，不可重启。
//!
//! ```text
//! beginning          window_start   window_end         terminal
//!     |-----...-----------|==============|------...--------|
//!                         └ 当前页缓冲 ┘
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::action::{self, Action};
use crate::correlation::Correlator;
use crate::entity::Message;
use crate::error::{CubeError, Result};

/// 单个窗口的数据来源
#[async_trait]
pub trait WindowSource: Send + Sync {
    /// 查询 `[beginning, ending)` 内的消息，按服务端顺序返回
    async fn query_window(&self, beginning: i64, ending: i64) -> Result<Vec<Message>>;
}

/// 历史范围：联系人会话或群组
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    Contact(u64),
    Group(u64),
}

/// 通过 `QueryMessages` 关联调用查询窗口
pub struct RemoteMessageSource {
    correlator: Arc<Correlator>,
    domain: String,
    scope: HistoryScope,
}

impl RemoteMessageSource {
    pub fn new(correlator: Arc<Correlator>, domain: impl Into<String>, scope: HistoryScope) -> Self {
        Self {
            correlator,
            domain: domain.into(),
            scope,
        }
    }
}

#[async_trait]
impl WindowSource for RemoteMessageSource {
    async fn query_window(&self, beginning: i64, ending: i64) -> Result<Vec<Message>> {
        let (contact_id, group_id) = match self.scope {
            HistoryScope::Contact(id) => (Some(id), None),
            HistoryScope::Group(id) => (None, Some(id)),
        };
        let response = self
            .correlator
            .call(Action::QueryMessages {
                domain: self.domain.clone(),
                contact_id,
                group_id,
                beginning,
                ending,
            })
            .await?;
        action::message_list_from(&response)
    }
}

/// 窗口化历史迭代器
pub struct MessageHistory<S: WindowSource> {
    source: S,
    beginning: i64,
    terminal: i64,
    step: i64,
    window_start: i64,
    window_end: i64,
    buffer: VecDeque<Message>,
    queries: usize,
}

impl<S: WindowSource> MessageHistory<S> {
    /// 从 `beginning` 开始遍历到当前时间
    pub async fn open(source: S, beginning: i64, step: i64) -> Result<Self> {
        let terminal = chrono::Utc::now().timestamp_millis();
        Self::open_until(source, beginning, terminal, step).await
    }

    /// 以显式的终点构造；首个窗口与空窗口跳过在构造时完成
    pub async fn open_until(source: S, beginning: i64, terminal: i64, step: i64) -> Result<Self> {
        if step <= 0 {
            return Err(CubeError::InvalidArgument(format!("窗口步长必须为正: {}", step)));
        }

        let mut history = Self {
            source,
            beginning,
            terminal,
            step,
            window_start: beginning,
            window_end: beginning,
            buffer: VecDeque::new(),
            queries: 0,
        };
        history.fill().await?;
        Ok(history)
    }

    /// 拉取下一个非空窗口，直到缓冲非空或抵达终点
    async fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && self.window_end < self.terminal {
            let start = self.window_end;
            let end = start.saturating_add(self.step).min(self.terminal);

            // 查询失败时窗口不前移，下次调用重试同一窗口
            let page = self.source.query_window(start, end).await?;
            self.queries += 1;
            self.window_start = start;
            self.window_end = end;
            debug!("历史窗口 [{}, {}) 返回 {} 条消息", start, end, page.len());
            self.buffer = page.into();
        }
        Ok(())
    }

    /// 是否还有下一条；缓冲耗尽时会继续拉取后续窗口
    pub async fn has_next(&mut self) -> Result<bool> {
        self.fill().await?;
        Ok(!self.buffer.is_empty())
    }

    /// 取出下一条，遍历结束时返回 `None`
    pub async fn next(&mut self) -> Result<Option<Message>> {
        self.fill().await?;
        Ok(self.buffer.pop_front())
    }

    pub fn beginning(&self) -> i64 {
        self.beginning
    }

    pub fn terminal(&self) -> i64 {
        self.terminal
    }

    /// 已发出的窗口查询次数
    pub fn queries(&self) -> usize {
        self.queries
    }
}
