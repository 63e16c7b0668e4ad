//! Cube SDK - 消息与存储服务客户端
//!
//! 本 SDK 在推送式的异步传输之上提供：
//! - 🔗 请求/响应关联：`_notifier` 关联 ID、待决请求表、超时驱逐
//! - 📡 入站分发：关联响应投递与推送事件路由
//! - 📤 流式上传：分块写出，增量 MD5 / SHA1
//! - 🕒 时间窗口历史遍历：空窗口自动跳过
//! - 🧵 有界工作池与 Promise 组合原语
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use cube_sdk::{CubeClient, CubeConfig, LoopbackTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     cube_sdk::init_tracing(false);
//!
//!     let config = CubeConfig::builder()
//!         .server("127.0.0.1:7000")
//!         .build();
//!
//!     let client = CubeClient::new(config, LoopbackTransport::new());
//!     client.connect().await?;
//!
//!     let contact = client.get_contact("shixincube.com", 50001001).await?;
//!     println!("联系人: {}", contact.name);
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod client;
pub mod config;
pub mod correlation;
pub mod dialect;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod executor;
pub mod file_storage;
pub mod history;
pub mod logging;
pub mod promise;
pub mod subscription;
pub mod transport;
pub mod upload;
pub mod version;

// 重新导出核心类型，方便使用
pub use action::{Action, EventScope, MarkReadData};
pub use client::CubeClient;
pub use config::{CubeConfig, CubeConfigBuilder, Endpoint};
pub use correlation::{CorrelationToken, Correlator, PendingTable};
pub use dialect::ActionDialect;
pub use dispatcher::{DispatchStats, InboundDispatcher, PushEvent};
pub use entity::{Contact, Device, FileLabel, Message};
pub use error::{CubeError, Result};
pub use executor::TaskExecutor;
pub use file_storage::FileStorage;
pub use history::{HistoryScope, MessageHistory, RemoteMessageSource, WindowSource};
pub use logging::init_tracing;
pub use promise::{Promise, Settle};
pub use subscription::{
    ContactEventListener, EventClass, EventSubscriptions, MessageListener, Registration, Removal,
};
pub use transport::{DialectTransport, InboundListener, LoopbackTransport, OutboundStream};
pub use upload::{channel_code, UploadListener, UploadReceipt, UploadSession, Uploader};
pub use version::{build_info, SDK_VERSION};
