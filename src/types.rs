//! 数据类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 会话状态
///
/// `Created → Queued → Working → {Finished | Failed}`，`Paused` 是 `Working` 的可逆分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Queued,
    Working,
    Paused,
    Finished,
    Failed,
}

impl SessionStatus {
    /// 终态
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Finished | SessionStatus::Failed)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(SessionStatus::Created),
            "queued" => Ok(SessionStatus::Queued),
            "working" => Ok(SessionStatus::Working),
            "paused" => Ok(SessionStatus::Paused),
            "finished" => Ok(SessionStatus::Finished),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Created => write!(f, "created"),
            SessionStatus::Queued => write!(f, "queued"),
            SessionStatus::Working => write!(f, "working"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Finished => write!(f, "finished"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Scan 状态，与根会话状态取值相同
pub type ScanStatus = SessionStatus;

/// Agent 状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Undefined,
    Registered,
    Approved,
    Blocked,
    /// Dispatcher 返回了本版本不认识的状态
    #[serde(other)]
    Unknown,
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Undefined
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Undefined => write!(f, "undefined"),
            AgentStatus::Registered => write!(f, "registered"),
            AgentStatus::Approved => write!(f, "approved"),
            AgentStatus::Blocked => write!(f, "blocked"),
            AgentStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Agent（远程 worker）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub status: AgentStatus,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Undefined,
        }
    }
}

/// 插件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// 容器镜像
    Container,
    /// 本地脚本，通过 Remote Plugin 协议与 Agent 通信
    Script,
}

/// 插件（带版本的可执行单元）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    /// 容器镜像（kind = container）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// 脚本路径（kind = script）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// 命令参数，支持 `{{key}}` 占位符
    #[serde(default)]
    pub command: Vec<String>,
}

/// Plan 中的一步：插件 + 解析后的配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Step {
    pub fn new(plugin: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            plugin: plugin.into(),
            version: None,
            config,
        }
    }
}

/// 会话：一次插件执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// 所属 Scan
    pub scan: String,
    pub status: SessionStatus,
    pub step: Step,
    pub plugin: String,
    /// 父会话（根会话为空）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// 通过 RunPlugin 派生的嵌套会话
    #[serde(default)]
    pub children: Vec<Session>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl Session {
    /// 创建根会话
    pub fn new(id: impl Into<String>, scan: impl Into<String>, step: Step) -> Self {
        let plugin = step.plugin.clone();
        Self {
            id: id.into(),
            scan: scan.into(),
            status: SessionStatus::Created,
            step,
            plugin,
            parent: None,
            children: Vec::new(),
            created: Utc::now(),
            queued: None,
            started: None,
            finished: None,
        }
    }

    /// 创建嵌套会话
    pub fn child_of(parent: &Session, id: impl Into<String>, step: Step) -> Self {
        let mut child = Session::new(id, parent.scan.clone(), step);
        child.parent = Some(parent.id.clone());
        child
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// 在会话树中查找（包括自身）
    pub fn find(&self, id: &str) -> Option<&Session> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Session> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }
}

/// Scan：一个 Plan 针对一个 Target 的一次执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: String,
    pub status: ScanStatus,
    /// 根会话，严格按顺序执行
    pub sessions: Vec<Session>,
    pub plan: String,
    pub target: String,
    pub project: String,
    pub owner: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl Scan {
    pub fn new(id: impl Into<String>, plan: impl Into<String>, target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Created,
            sessions: Vec::new(),
            plan: plan.into(),
            target: target.into(),
            project: String::new(),
            owner: String::new(),
            created: now,
            updated: now,
            queued: None,
            started: None,
            finished: None,
        }
    }

    /// 追加一个根会话（按步骤顺序）
    pub fn push_step(&mut self, session_id: impl Into<String>, step: Step) -> &Session {
        let session = Session::new(session_id, self.id.clone(), step);
        self.sessions.push(session);
        &self.sessions[self.sessions.len() - 1]
    }

    /// 在所有会话树中查找
    pub fn find_session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find_map(|s| s.find(id))
    }

    pub fn find_session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find_map(|s| s.find_mut(id))
    }
}

/// Job 命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCmd {
    /// 无事可做，下一轮再问
    Repeat,
    /// 执行 `scan` 字段中的会话
    Scan,
}

/// Scheduler 派发给 Agent 的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub cmd: JobCmd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan: Option<Session>,
}

impl Job {
    pub fn scan(session: Session) -> Self {
        Self {
            cmd: JobCmd::Scan,
            scan: Some(session),
        }
    }

    pub fn repeat() -> Self {
        Self {
            cmd: JobCmd::Repeat,
            scan: None,
        }
    }
}

/// 插件提交的报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub data: serde_json::Value,
    /// 附带文件的 ID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// 文件内容（线上以 base64 编码）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
