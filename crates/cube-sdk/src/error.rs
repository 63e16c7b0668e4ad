//! SDK 错误类型
//!
//! 按失败原因显式区分：
//! 未连接、超时、响应格式错误、服务端错误码、本地 IO 失败。

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CubeError {
    /// 传输层报告未连接，请求未发出
    #[error("Not connected")]
    NotConnected,

    /// 在截止时间内没有收到匹配的响应
    #[error("Timeout: no response for {action} after {}ms", .elapsed.as_millis())]
    Timeout { action: String, elapsed: Duration },

    /// 响应缺少期望的字段
    #[error("Malformed response for {action}: {reason}")]
    MalformedResponse { action: String, reason: String },

    /// 响应携带非 OK 状态码
    #[error("Remote error [{code}] for {action}")]
    Remote { action: String, code: i64 },

    /// 本地文件读取或字节通道写入失败
    #[error("IO error: {0}")]
    IO(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 工作池已关闭，任务无法提交
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<std::io::Error> for CubeError {
    fn from(error: std::io::Error) -> Self {
        CubeError::IO(error.to_string())
    }
}

impl From<serde_json::Error> for CubeError {
    fn from(error: serde_json::Error) -> Self {
        CubeError::Serialization(error.to_string())
    }
}

impl CubeError {
    /// 构造响应缺字段错误
    pub fn malformed(action: &str, reason: impl Into<String>) -> Self {
        CubeError::MalformedResponse {
            action: action.to_string(),
            reason: reason.into(),
        }
    }

    /// 获取服务端错误码（如果这是一个 Remote 错误）
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            CubeError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CubeError::Timeout { .. })
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, CubeError::NotConnected)
    }
}

pub type Result<T> = std::result::Result<T, CubeError>;
