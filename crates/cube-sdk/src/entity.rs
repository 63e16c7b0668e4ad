//! 领域值对象（与服务端 JSON 结构对应的惰性记录）

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version;

/// 联系人
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: u64,
    pub domain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
}

impl Contact {
    pub fn new(id: u64, domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            domain: domain.into(),
            name: name.into(),
            context: None,
            devices: Vec::new(),
        }
    }
}

/// 终端设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub platform: String,
}

impl Device {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
        }
    }

    /// 当前进程所代表的设备
    pub fn current() -> Self {
        Self {
            name: std::env::consts::OS.to_string(),
            platform: version::platform_tag(),
        }
    }
}

/// 消息
///
/// `source` 非 0 时表示群组消息，值为群组 ID。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub domain: String,
    pub from: u64,
    pub to: u64,
    #[serde(default)]
    pub source: u64,
    /// 本地时间戳（毫秒）
    #[serde(default)]
    pub lts: i64,
    /// 服务端时间戳（毫秒）
    #[serde(default)]
    pub rts: i64,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn is_group(&self) -> bool {
        self.source != 0
    }
}

/// 文件标签：服务端存储对象的描述符
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLabel {
    pub domain: String,
    pub file_code: String,
    pub owner_id: u64,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub completed_time: i64,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1_code: Option<String>,
    #[serde(rename = "fileURL", default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(rename = "fileSecureURL", default, skip_serializing_if = "Option::is_none")]
    pub file_secure_url: Option<String>,
}

/// 根据扩展名推断文件类型
pub fn file_type_of(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext.to_lowercase(),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contact_from_server_json() {
        let contact: Contact = serde_json::from_value(json!({
            "id": 50001001,
            "domain": "shixincube.com",
            "name": "Cube",
            "context": { "level": 3 },
            "devices": [{ "name": "linux", "platform": "Web" }],
            "timestamp": 1700000000000i64
        }))
        .unwrap();
        assert_eq!(contact.id, 50001001);
        assert_eq!(contact.devices.len(), 1);
        assert_eq!(contact.context, Some(json!({ "level": 3 })));
    }

    #[test]
    fn test_file_label_field_names() {
        let label = FileLabel {
            domain: "shixincube.com".to_string(),
            file_code: "code".to_string(),
            owner_id: 1,
            file_name: "a.png".to_string(),
            file_size: 10,
            last_modified: 0,
            completed_time: 0,
            expiry_time: 0,
            file_type: "png".to_string(),
            md5_code: Some("m".to_string()),
            sha1_code: None,
            file_url: Some("http://x".to_string()),
            file_secure_url: None,
        };
        let value = serde_json::to_value(&label).unwrap();
        assert_eq!(value["fileCode"], "code");
        assert_eq!(value["ownerId"], 1);
        assert_eq!(value["md5Code"], "m");
        assert_eq!(value["fileURL"], "http://x");
        assert!(value.get("sha1Code").is_none());
    }

    #[test]
    fn test_file_type_of() {
        assert_eq!(file_type_of("photo.JPG"), "jpg");
        assert_eq!(file_type_of("archive.tar.gz"), "gz");
        assert_eq!(file_type_of("README"), "unknown");
    }

    #[test]
    fn test_group_message() {
        let message: Message = serde_json::from_value(json!({
            "id": 1, "domain": "d", "from": 2, "to": 3, "source": 9
        }))
        .unwrap();
        assert!(message.is_group());
        assert_eq!(message.payload, Value::Null);
    }
}
