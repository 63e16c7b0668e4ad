//! SDK 配置
//!
//! 所有超时与分块参数集中在 `CubeConfig`，由 `CubeConfigBuilder` 构建，
//! 构造后随 `CubeClient` 显式传递，不使用全局单例。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认关联调用超时：5 分钟
pub const DEFAULT_CORRELATION_TIMEOUT_SECS: u64 = 5 * 60;
/// 默认上传分块：128 KiB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 128 * 1024;
/// 默认上传收尾等待（毫秒），避开服务端 flush 竞争
pub const DEFAULT_UPLOAD_GRACE_MS: u64 = 50;
/// 默认历史窗口步长：12 小时
pub const DEFAULT_HISTORY_STEP_MS: i64 = 12 * 60 * 60 * 1000;

/// 服务端点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7000,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Cube SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeConfig {
    /// 服务端点
    pub endpoint: Endpoint,
    /// 关联调用超时（毫秒），对所有关联调用统一生效
    pub correlation_timeout_ms: u64,
    /// 上传分块大小（字节）
    pub upload_chunk_size: usize,
    /// 上传关闭通道后的等待（毫秒）
    pub upload_grace_ms: u64,
    /// 历史窗口步长（毫秒）
    pub history_step_ms: i64,
    /// 文件上传链路（上传 → 登记 → 查询）总等待（毫秒）
    pub file_chain_timeout_ms: u64,
    /// 后台工作池的工作协程数量
    pub worker_count: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for CubeConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            correlation_timeout_ms: DEFAULT_CORRELATION_TIMEOUT_SECS * 1000,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            upload_grace_ms: DEFAULT_UPLOAD_GRACE_MS,
            history_step_ms: DEFAULT_HISTORY_STEP_MS,
            file_chain_timeout_ms: DEFAULT_CORRELATION_TIMEOUT_SECS * 1000,
            worker_count: 4,
            debug_mode: false,
        }
    }
}

impl CubeConfig {
    pub fn builder() -> CubeConfigBuilder {
        CubeConfigBuilder::new()
    }

    pub fn correlation_timeout(&self) -> Duration {
        Duration::from_millis(self.correlation_timeout_ms)
    }

    pub fn upload_grace(&self) -> Duration {
        Duration::from_millis(self.upload_grace_ms)
    }

    pub fn file_chain_timeout(&self) -> Duration {
        Duration::from_millis(self.file_chain_timeout_ms)
    }
}

/// Cube SDK 配置构建器
pub struct CubeConfigBuilder {
    config: CubeConfig,
}

impl Default for CubeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CubeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CubeConfig::default(),
        }
    }

    /// 设置服务端点，格式 `host:port`；端口缺失时使用默认端口
    pub fn server<S: AsRef<str>>(mut self, address: S) -> Self {
        let address = address.as_ref();
        let endpoint = match address.rfind(':') {
            Some(pos) => match address[pos + 1..].parse::<u16>() {
                Ok(port) => Endpoint {
                    host: address[..pos].to_string(),
                    port,
                },
                Err(_) => Endpoint {
                    host: address.to_string(),
                    port: Endpoint::default().port,
                },
            },
            None => Endpoint {
                host: address.to_string(),
                port: Endpoint::default().port,
            },
        };
        self.config.endpoint = endpoint;
        self
    }

    pub fn correlation_timeout(mut self, timeout: Duration) -> Self {
        self.config.correlation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn upload_chunk_size(mut self, size: usize) -> Self {
        // 0 字节分块会让读取循环无法前进
        self.config.upload_chunk_size = size.max(1);
        self
    }

    pub fn upload_grace(mut self, grace: Duration) -> Self {
        self.config.upload_grace_ms = grace.as_millis() as u64;
        self
    }

    /// 设置历史窗口步长
    pub fn history_step(mut self, step: Duration) -> Self {
        self.config.history_step_ms = (step.as_millis() as i64).max(1);
        self
    }

    pub fn file_chain_timeout(mut self, timeout: Duration) -> Self {
        self.config.file_chain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count.max(1);
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> CubeConfig {
        self.config
    }
}
