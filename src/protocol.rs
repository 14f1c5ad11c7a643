//! 线上协议定义
//!
//! 通用层：每条消息一个 JSON 对象 `{"id": <int>, "cmd": <int>, "data": <任意 JSON>}`。
//! 流式传输（Unix Socket / TCP / TLS）按行分隔（JSONL），WebSocket 每帧一条消息。
//!
//! 类型层：Remote Plugin 协议在 `data` 中嵌套 [`RequestV1`] / [`ResponseV1`]。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{FileBlob, Report, Step};

/// 通用命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Command {
    Request,
    Response,
    Error,
    /// 未知命令：保留原值，由 Transport 作为协议错误处理
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(v: u8) -> Self {
        match v {
            0 => Command::Request,
            1 => Command::Response,
            2 => Command::Error,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> Self {
        match c {
            Command::Request => 0,
            Command::Response => 1,
            Command::Error => 2,
            Command::Unknown(v) => v,
        }
    }
}

/// 消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 连接内单调递增，用于关联请求与响应
    pub id: u64,
    pub cmd: Command,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Message {
    pub fn request(id: u64, data: serde_json::Value) -> Self {
        Self {
            id,
            cmd: Command::Request,
            data,
        }
    }

    pub fn response(id: u64, data: serde_json::Value) -> Self {
        Self {
            id,
            cmd: Command::Response,
            data,
        }
    }

    /// Error 消息的 data 是错误描述字符串
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            cmd: Command::Error,
            data: serde_json::Value::String(message.into()),
        }
    }

    pub fn error_message(&self) -> String {
        match &self.data {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => "unknown error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Remote Plugin 协议方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Method {
    Ping,
    Connect,
    GetConfig,
    GetPluginVersions,
    RunPlugin,
    SendReport,
    DownloadFile,
    Unknown(u8),
}

impl From<u8> for Method {
    fn from(v: u8) -> Self {
        match v {
            0 => Method::Ping,
            1 => Method::Connect,
            2 => Method::GetConfig,
            3 => Method::GetPluginVersions,
            4 => Method::RunPlugin,
            5 => Method::SendReport,
            6 => Method::DownloadFile,
            other => Method::Unknown(other),
        }
    }
}

impl From<Method> for u8 {
    fn from(m: Method) -> Self {
        match m {
            Method::Ping => 0,
            Method::Connect => 1,
            Method::GetConfig => 2,
            Method::GetPluginVersions => 3,
            Method::RunPlugin => 4,
            Method::SendReport => 5,
            Method::DownloadFile => 6,
            Method::Unknown(v) => v,
        }
    }
}

/// Connect 握手内容（Server → Client）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// 插件所属会话
    pub session: String,
    /// Agent 版本（`VERSION_FULL`）
    pub version: String,
}

/// 类型化请求，每个方法一个字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestV1 {
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectInfo>,
    /// 插件名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_plugin_versions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_plugin: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_report: Option<Report>,
    /// 文件 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_file: Option<String>,
}

impl RequestV1 {
    fn bare(method: Method) -> Self {
        Self {
            method,
            connect: None,
            get_plugin_versions: None,
            run_plugin: None,
            send_report: None,
            download_file: None,
        }
    }

    pub fn ping() -> Self {
        Self::bare(Method::Ping)
    }

    pub fn connect(info: ConnectInfo) -> Self {
        Self {
            connect: Some(info),
            ..Self::bare(Method::Connect)
        }
    }

    pub fn get_config() -> Self {
        Self::bare(Method::GetConfig)
    }

    pub fn get_plugin_versions(name: impl Into<String>) -> Self {
        Self {
            get_plugin_versions: Some(name.into()),
            ..Self::bare(Method::GetPluginVersions)
        }
    }

    pub fn run_plugin(step: Step) -> Self {
        Self {
            run_plugin: Some(step),
            ..Self::bare(Method::RunPlugin)
        }
    }

    pub fn send_report(report: Report) -> Self {
        Self {
            send_report: Some(report),
            ..Self::bare(Method::SendReport)
        }
    }

    pub fn download_file(id: impl Into<String>) -> Self {
        Self {
            download_file: Some(id.into()),
            ..Self::bare(Method::DownloadFile)
        }
    }
}

/// 类型化响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseV1 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileBlob>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let msg = Message::request(7, json!({"method": 2}));
        let wire = msg.encode().unwrap();
        assert_eq!(wire, r#"{"id":7,"cmd":0,"data":{"method":2}}"#);

        let err = Message::error(8, "boom");
        assert_eq!(err.encode().unwrap(), r#"{"id":8,"cmd":2,"data":"boom"}"#);
        assert_eq!(err.error_message(), "boom");
    }

    #[test]
    fn test_message_round_trip_with_typed_payload() {
        let request = RequestV1::run_plugin(Step::new("nuclei", json!({"severity": "high"})));
        let msg = Message::request(42, serde_json::to_value(&request).unwrap());

        let parsed = Message::parse(&msg.encode().unwrap()).unwrap();
        assert_eq!(parsed.id, 42);
        assert_eq!(parsed.cmd, Command::Request);
        let decoded: RequestV1 = parsed.decode().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_unknown_command_preserved() {
        let msg = Message::parse(r#"{"id":3,"cmd":9}"#).unwrap();
        assert_eq!(msg.cmd, Command::Unknown(9));
        assert!(msg.data.is_null());
        assert!(msg.encode().unwrap().contains("\"cmd\":9"));
    }

    #[test]
    fn test_request_v1_only_carries_its_field() {
        let json = serde_json::to_string(&RequestV1::get_plugin_versions("nmap")).unwrap();
        assert_eq!(json, r#"{"method":3,"get_plugin_versions":"nmap"}"#);

        let parsed: RequestV1 = serde_json::from_str(r#"{"method":77}"#).unwrap();
        assert_eq!(parsed.method, Method::Unknown(77));
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(Message::parse("{\"id\":\"x\"}").is_err());
        assert!(Message::parse("not json").is_err());
    }
}
