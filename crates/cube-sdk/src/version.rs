//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Runtime Metadata** → 本模块，随 `Device` 描述一起上报给服务端

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 设备平台描述：`cube-sdk/<version>`
pub fn platform_tag() -> String {
    format!("cube-sdk/{}", SDK_VERSION)
}

/// 完整构建信息：`cube-sdk/<version> (<git sha>, built <time>)`
pub fn build_info() -> String {
    format!("{} ({}, built {})", platform_tag(), GIT_SHA, BUILD_TIME)
}
