//! 日志初始化
//!
//! 过滤规则优先级：`RUST_LOG` → `CUBE_LOG` → 默认过滤器（调试模式下为 debug）。

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,cube_sdk=info";
const DEBUG_FILTER: &str = "info,cube_sdk=debug";

/// 安装全局 tracing subscriber；重复调用无副作用
pub fn init_tracing(debug_mode: bool) {
    let env_filter = filter_from_env(debug_mode);
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env(debug_mode: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("CUBE_LOG").ok().filter(|v| !v.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(value) {
            return filter;
        }
    }

    EnvFilter::new(if debug_mode { DEBUG_FILTER } else { DEFAULT_FILTER })
}
