//! 配置
//!
//! 所有配置均可由环境变量覆盖，未设置时使用默认值。

#[cfg(feature = "agent")]
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{Endpoint, TlsConfig};

/// 插件侧连接 Agent 的 endpoint
pub const ENV_ENDPOINT: &str = "SCANFLEET_ENDPOINT";
/// 插件所属会话 ID
pub const ENV_SESSION: &str = "SCANFLEET_SESSION";

/// `RunPlugin` 轮询子会话的间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    /// 正常轮询
    pub poll: Duration,
    /// 出错后
    pub error: Duration,
    /// 子会话暂停时
    pub paused: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(2),
            error: Duration::from_secs(15),
            paused: Duration::from_secs(30),
        }
    }
}

/// Agent 配置
#[cfg(feature = "agent")]
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 数据目录（PID 文件、插件 socket）
    pub data_dir: PathBuf,
    /// Agent 名称，与 `agent_type` 一起唯一标识一个 Agent
    pub name: String,
    pub agent_type: String,
    /// Dispatcher 地址，例如 `http://127.0.0.1:8080`
    pub dispatcher_url: String,
    /// Bearer token
    pub token: Option<String>,
    /// 出错或等待审批时的退避间隔
    pub backoff: Duration,
    /// docker 可执行文件
    pub docker_binary: String,
    pub tls: TlsConfig,
    pub poll: PollIntervals,
}

#[cfg(feature = "agent")]
impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".scanfleet"))
            .unwrap_or_else(|| PathBuf::from("/tmp/scanfleet"));

        Self {
            data_dir,
            name: default_agent_name(),
            agent_type: "docker".to_string(),
            dispatcher_url: "http://127.0.0.1:8080".to_string(),
            token: None,
            backoff: Duration::from_secs(10),
            docker_binary: "docker".to_string(),
            tls: TlsConfig::default(),
            poll: PollIntervals::default(),
        }
    }
}

#[cfg(feature = "agent")]
impl AgentConfig {
    /// 从环境变量读取，未设置的项使用默认值
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("SCANFLEET_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("SCANFLEET_AGENT_NAME") {
            config.name = name;
        }
        if let Ok(agent_type) = std::env::var("SCANFLEET_AGENT_TYPE") {
            config.agent_type = agent_type;
        }
        if let Ok(url) = std::env::var("SCANFLEET_DISPATCHER_URL") {
            config.dispatcher_url = url.trim_end_matches('/').to_string();
        }
        config.token = std::env::var("SCANFLEET_TOKEN").ok().filter(|t| !t.is_empty());
        if let Ok(secs) = std::env::var("SCANFLEET_BACKOFF_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| Error::Config(format!("SCANFLEET_BACKOFF_SECS 不是整数: {}", secs)))?;
            config.backoff = Duration::from_secs(secs);
        }
        if let Ok(docker) = std::env::var("SCANFLEET_DOCKER") {
            config.docker_binary = docker;
        }
        if let Ok(ca) = std::env::var("SCANFLEET_CA_FILE") {
            config.tls = config.tls.with_ca_file(ca);
        }

        Ok(config)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("agent.pid")
    }

    /// 插件 socket 目录
    pub fn run_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }
}

#[cfg(feature = "agent")]
fn default_agent_name() -> String {
    sysinfo::System::host_name()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "agent".to_string())
}

/// 插件侧 Remote Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Agent 传入的会话 ID（可选，仅用于日志）
    pub session: Option<String>,
    pub tls: TlsConfig,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            session: None,
            tls: TlsConfig::default(),
        }
    }

    /// 读取 Agent 启动脚本插件时注入的环境变量
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(ENV_ENDPOINT)
            .map_err(|_| Error::Config(format!("{} 未设置", ENV_ENDPOINT)))?;
        let mut config = Self::new(raw.parse()?);
        config.session = std::env::var(ENV_SESSION).ok();
        if let Ok(ca) = std::env::var("SCANFLEET_CA_FILE") {
            config.tls = config.tls.with_ca_file(ca);
        }
        Ok(config)
    }
}
