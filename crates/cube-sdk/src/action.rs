//! 远端动作目录
//!
//! 每个动作是一个带类型字段的变体，统一经 `Action::into_dialect` 序列化为
//! `{action, params}`；响应经对应的解析函数转成类型化结果，
//! 成功判据不满足时返回 `MalformedResponse` 或 `Remote`。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialect::ActionDialect;
use crate::entity::{Contact, Device, FileLabel, Message};
use crate::error::{CubeError, Result};

/// 服务端状态码：成功
pub const STATE_OK: i64 = 0;

/// 推送订阅的作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventScope {
    Contact {
        domain: String,
        #[serde(rename = "contactId")]
        contact_id: u64,
    },
    Group {
        domain: String,
        #[serde(rename = "groupId")]
        group_id: u64,
    },
}

impl EventScope {
    pub fn domain(&self) -> &str {
        match self {
            EventScope::Contact { domain, .. } | EventScope::Group { domain, .. } => domain,
        }
    }

    pub fn entity_id(&self) -> u64 {
        match self {
            EventScope::Contact { contact_id, .. } => *contact_id,
            EventScope::Group { group_id, .. } => *group_id,
        }
    }
}

/// 标记已读的数据体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkReadData {
    pub to: u64,
    pub from: u64,
    pub list: Vec<u64>,
}

/// 动作目录（封闭集合）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", content = "params")]
pub enum Action {
    GetContact {
        domain: String,
        #[serde(rename = "contactId")]
        contact_id: u64,
    },
    CreateContact {
        domain: String,
        id: u64,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    PushMessage {
        message: Message,
        pretender: Contact,
        device: Device,
    },
    QueryMessages {
        domain: String,
        #[serde(rename = "contactId", skip_serializing_if = "Option::is_none")]
        contact_id: Option<u64>,
        #[serde(rename = "groupId", skip_serializing_if = "Option::is_none")]
        group_id: Option<u64>,
        beginning: i64,
        ending: i64,
    },
    PutFile {
        #[serde(rename = "fileLabel")]
        file_label: FileLabel,
    },
    GetFile {
        domain: String,
        #[serde(rename = "fileCode")]
        file_code: String,
    },
    MarkReadMessages {
        domain: String,
        data: MarkReadData,
    },
    AddEventListener {
        id: u64,
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        param: Option<EventScope>,
    },
    RemoveEventListener {
        id: u64,
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        param: Option<EventScope>,
    },
}

impl Action {
    /// 动作名（与线上 `action` 字段一致）
    pub fn name(&self) -> &'static str {
        match self {
            Action::GetContact { .. } => "GetContact",
            Action::CreateContact { .. } => "CreateContact",
            Action::PushMessage { .. } => "PushMessage",
            Action::QueryMessages { .. } => "QueryMessages",
            Action::PutFile { .. } => "PutFile",
            Action::GetFile { .. } => "GetFile",
            Action::MarkReadMessages { .. } => "MarkReadMessages",
            Action::AddEventListener { .. } => "AddEventListener",
            Action::RemoveEventListener { .. } => "RemoveEventListener",
        }
    }

    /// 序列化为方言
    pub fn into_dialect(self) -> Result<ActionDialect> {
        let value = serde_json::to_value(&self)
            .map_err(|e| CubeError::Serialization(format!("序列化动作 {} 失败: {}", self.name(), e)))?;
        serde_json::from_value(value)
            .map_err(|e| CubeError::Serialization(format!("构造方言 {} 失败: {}", self.name(), e)))
    }
}

/// 把响应 params 解成类型 T；字段缺失视为格式错误
fn decode_params<T: DeserializeOwned>(action: &str, response: &ActionDialect) -> Result<T> {
    serde_json::from_value(Value::Object(response.params.clone()))
        .map_err(|e| CubeError::malformed(action, e.to_string()))
}

#[derive(Deserialize)]
struct ContactEnvelope {
    contact: Option<Contact>,
}

#[derive(Deserialize)]
struct StateResult {
    state: i64,
}

#[derive(Deserialize)]
struct PushEnvelope {
    result: Option<StateResult>,
}

#[derive(Deserialize)]
struct ListResult {
    #[serde(default)]
    list: Vec<Message>,
}

#[derive(Deserialize)]
struct QueryEnvelope {
    result: Option<ListResult>,
}

#[derive(Deserialize)]
struct FileEnvelope {
    code: Option<i64>,
    #[serde(rename = "fileLabel")]
    file_label: Option<FileLabel>,
}

#[derive(Deserialize)]
struct MessagesResult {
    messages: Option<Vec<Message>>,
}

#[derive(Deserialize)]
struct MarkReadEnvelope {
    result: Option<MessagesResult>,
}

/// GetContact / CreateContact：以 `contact` 存在为成功
pub fn contact_from(action: &str, response: &ActionDialect) -> Result<Contact> {
    let envelope: ContactEnvelope = decode_params(action, response)?;
    envelope
        .contact
        .ok_or_else(|| CubeError::malformed(action, "missing contact"))
}

/// PushMessage：`result.state == OK`
pub fn push_state_from(response: &ActionDialect) -> Result<()> {
    let action = "PushMessage";
    let envelope: PushEnvelope = decode_params(action, response)?;
    let result = envelope
        .result
        .ok_or_else(|| CubeError::malformed(action, "missing result"))?;
    if result.state != STATE_OK {
        return Err(CubeError::Remote {
            action: action.to_string(),
            code: result.state,
        });
    }
    Ok(())
}

/// QueryMessages：`result` 存在即成功，`list` 缺省为空
pub fn message_list_from(response: &ActionDialect) -> Result<Vec<Message>> {
    let action = "QueryMessages";
    let envelope: QueryEnvelope = decode_params(action, response)?;
    envelope
        .result
        .map(|r| r.list)
        .ok_or_else(|| CubeError::malformed(action, "missing result"))
}

/// PutFile / GetFile：`code == OK` 且带 `fileLabel`
pub fn file_label_from(action: &str, response: &ActionDialect) -> Result<FileLabel> {
    let envelope: FileEnvelope = decode_params(action, response)?;
    let code = envelope
        .code
        .ok_or_else(|| CubeError::malformed(action, "missing code"))?;
    if code != STATE_OK {
        return Err(CubeError::Remote {
            action: action.to_string(),
            code,
        });
    }
    envelope
        .file_label
        .ok_or_else(|| CubeError::malformed(action, "missing fileLabel"))
}

/// MarkReadMessages：`result.messages` 存在即成功
pub fn read_messages_from(response: &ActionDialect) -> Result<Vec<Message>> {
    let action = "MarkReadMessages";
    let envelope: MarkReadEnvelope = decode_params(action, response)?;
    envelope
        .result
        .and_then(|r| r.messages)
        .ok_or_else(|| CubeError::malformed(action, "missing result.messages"))
}
