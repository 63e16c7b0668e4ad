//! 方言传输层接口
//!
//! 传输层是外部协作者：负责连接单一服务端点、发送方言、打开命名的出站字节通道，
//! 并把所有入站方言交给唯一注册的监听器。帧格式与连接复用不在本 crate 范围内。

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::dialect::ActionDialect;
use crate::error::Result;

pub mod loopback;

pub use loopback::{reply_to, LoopbackTransport, StreamCapture};

/// 入站监听器（由分发器实现）
///
/// 传输层在单一分发路径上依次调用，实现方不得长时间阻塞。
pub trait InboundListener: Send + Sync {
    /// 收到一条入站方言
    fn on_dialect(&self, dialect: ActionDialect);

    /// 收到一段入站字节流数据
    fn on_stream(&self, name: &str, data: Bytes) {
        tracing::debug!("忽略入站字节流: name={}, size={}", name, data.len());
    }
}

/// 出站字节通道
#[async_trait]
pub trait OutboundStream: Send {
    /// 按顺序写入一段数据
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// 刷新并关闭通道，向对端标记数据结束
    async fn close(&mut self) -> Result<()>;

    /// 放弃通道，向对端标记数据不完整
    async fn abort(&mut self) -> Result<()>;
}

/// 方言传输层
#[async_trait]
pub trait DialectTransport: Send + Sync {
    /// 连接服务端点
    async fn connect(&self) -> Result<()>;

    /// 当前是否已连接（检查与随后的发送之间不是原子的）
    fn is_connected(&self) -> bool;

    /// 发送一条方言（不等待响应）
    async fn send(&self, dialect: ActionDialect) -> Result<()>;

    /// 以指定名称打开出站字节通道
    async fn open_output_stream(&self, name: &str) -> Result<Box<dyn OutboundStream>>;

    /// 注册入站监听器；后注册的替换先注册的
    fn set_listener(&self, listener: Arc<dyn InboundListener>);
}
