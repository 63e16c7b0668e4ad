//! 动作方言（Action Dialect）与线上编解码
//!
//! 线上格式：`{"action": <name>, "params": {...}}`。
//! 关联调用在 `params._notifier` 中携带 `{"id": <u64>}`，服务端原样回传。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CubeError, Result};

/// 关联对象在 params 中的键名
pub const NOTIFIER_KEY: &str = "_notifier";
/// 推送事件名在 params 中的键名
pub const EVENT_KEY: &str = "event";

/// 一次请求/响应/推送的基本单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDialect {
    #[serde(rename = "action")]
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ActionDialect {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// 嵌入关联对象
    pub fn set_notifier(&mut self, id: u64) {
        self.params
            .insert(NOTIFIER_KEY.to_string(), serde_json::json!({ "id": id }));
    }

    /// 读取关联 ID；无关联对象或格式不符时返回 None
    pub fn notifier_id(&self) -> Option<u64> {
        self.params
            .get(NOTIFIER_KEY)
            .and_then(|n| n.get("id"))
            .and_then(Value::as_u64)
    }

    pub fn is_correlated(&self) -> bool {
        self.params.contains_key(NOTIFIER_KEY)
    }

    /// 推送事件名：优先取 `params.event`，否则退回到动作名
    pub fn event_name(&self) -> &str {
        self.params
            .get(EVENT_KEY)
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
    }
}

/// 编码为线上字节
pub fn encode(dialect: &ActionDialect) -> Result<Bytes> {
    let data = serde_json::to_vec(dialect)
        .map_err(|e| CubeError::Serialization(format!("编码方言失败: {}", e)))?;
    Ok(Bytes::from(data))
}

/// 从线上字节解码
pub fn decode(data: &[u8]) -> Result<ActionDialect> {
    serde_json::from_slice(data)
        .map_err(|e| CubeError::Serialization(format!("解码方言失败: {}", e)))
}
