//! Dispatcher 协作者
//!
//! Agent 与 Remote Server 只通过 [`DispatcherApi`] 访问 Dispatcher：
//! - [`HttpDispatcher`]：HTTP + JSON 客户端（`agent` feature）
//! - [`LocalDispatcher`]：进程内实现，直接持有 Scheduler 与 Scan 存储
//!
//! 冲突（409）与不存在（404）必须与其他错误区分，分别映射为
//! [`Error::Conflict`](crate::Error::Conflict) 与 [`Error::NotFound`](crate::Error::NotFound)。

#[cfg(feature = "agent")]
mod http;
mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AgentInfo, FileBlob, Job, Plugin, Report, Session, Step};

#[cfg(feature = "agent")]
pub use http::HttpDispatcher;
pub use local::LocalDispatcher;

/// Dispatcher API
#[async_trait]
pub trait DispatcherApi: Send + Sync {
    /// 注册 Agent；同名同类型已存在时返回 `Conflict`
    async fn agents_create(&self, agent: &AgentInfo) -> Result<AgentInfo>;

    async fn agents_list(&self, name: &str, agent_type: &str) -> Result<Vec<AgentInfo>>;

    async fn agents_get(&self, id: &str) -> Result<AgentInfo>;

    async fn agents_update(&self, agent: &AgentInfo) -> Result<AgentInfo>;

    /// 领取作业（GetJobs）
    async fn agents_jobs(&self, agent_id: &str) -> Result<Vec<Job>>;

    /// 获取插件；未指定版本时取最新
    async fn plugins_get(&self, name: &str, version: Option<&str>) -> Result<Plugin>;

    async fn plugins_list(&self, name: &str) -> Result<Vec<Plugin>>;

    async fn session_update(&self, session: &Session) -> Result<()>;

    /// 在 `parent` 下创建嵌套会话
    async fn session_add_child(&self, parent: &Session, step: &Step) -> Result<Session>;

    async fn session_get(&self, scan: &str, session: &str) -> Result<Session>;

    async fn session_report_get(&self, scan: &str, session: &str) -> Result<Report>;

    async fn session_report_submit(&self, session: &Session, report: &Report) -> Result<()>;

    async fn files_download(&self, id: &str) -> Result<FileBlob>;
}
