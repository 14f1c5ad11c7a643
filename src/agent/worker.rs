//! Agent 轮询状态机
//!
//! `Undefined → Registered → Approved`，`Blocked` 与未知状态终止进程。
//! 每轮结束后按返回的间隔等待：状态推进时立即进入下一轮，
//! 处理完一批任务、出错或等待审批时退避。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::pidfile;
use super::runner::{ContainerRunner, DockerRunner};
use crate::config::AgentConfig;
use crate::dispatcher::{DispatcherApi, HttpDispatcher};
use crate::error::{Error, Result};
use crate::types::{AgentInfo, AgentStatus, Job, JobCmd};

pub struct Agent {
    pub(super) config: AgentConfig,
    pub(super) dispatcher: Arc<dyn DispatcherApi>,
    pub(super) runner: Arc<dyn ContainerRunner>,
    info: AgentInfo,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        dispatcher: Arc<dyn DispatcherApi>,
        runner: Arc<dyn ContainerRunner>,
    ) -> Self {
        let info = AgentInfo::new(&config.name, &config.agent_type);
        Self {
            config,
            dispatcher,
            runner,
            info,
        }
    }

    /// HTTP Dispatcher + docker CLI
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let dispatcher = Arc::new(HttpDispatcher::from_config(&config)?);
        let runner = Arc::new(DockerRunner::new(&config.docker_binary));
        Ok(Self::new(config, dispatcher, runner))
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 运行轮询循环直到取消或遇到致命错误
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        pidfile::write_pid_file(&self.config)?;
        tracing::info!(
            "🚀 Agent 启动: {}/{} -> {}",
            self.info.agent_type,
            self.info.name,
            self.config.dispatcher_url
        );

        let result = self.poll_loop(cancel).await;

        pidfile::remove_pid_file(&self.config);
        tracing::info!("🧹 Agent 清理完成");
        result
    }

    async fn poll_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let delay = match self.step(cancel).await {
                Ok(delay) => delay,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    tracing::error!(agent = %self.info.id, "❌ Agent 终止: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(agent = %self.info.id, "poll failed, retry in {:?}: {}", self.config.backoff, e);
                    self.config.backoff
                }
            };

            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 执行一轮状态机，返回下一轮之前的等待时间
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<Duration> {
        match self.info.status {
            AgentStatus::Undefined => {
                self.register().await?;
                if self.info.status == AgentStatus::Undefined {
                    tracing::warn!(agent = %self.info.id, "dispatcher returned agent without status");
                    Ok(self.config.backoff)
                } else {
                    Ok(Duration::ZERO)
                }
            }
            AgentStatus::Registered => {
                self.retrieve().await?;
                if self.info.status == AgentStatus::Registered {
                    tracing::info!(agent = %self.info.id, "⏳ waiting for approval");
                    Ok(self.config.backoff)
                } else {
                    Ok(Duration::ZERO)
                }
            }
            AgentStatus::Approved => self.poll_jobs(cancel).await,
            AgentStatus::Blocked => Err(Error::AgentBlocked),
            AgentStatus::Unknown => Err(Error::UnknownAgentStatus(self.info.status.to_string())),
        }
    }

    async fn register(&mut self) -> Result<()> {
        let request = AgentInfo::new(&self.config.name, &self.config.agent_type);
        self.info = match self.dispatcher.agents_create(&request).await {
            Ok(agent) => {
                tracing::info!(agent = %agent.id, "🆕 registered");
                agent
            }
            Err(e) if e.is_conflict() => {
                let existing = self
                    .dispatcher
                    .agents_list(&request.name, &request.agent_type)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::NotFound(format!("agent {}/{}", request.agent_type, request.name))
                    })?;
                tracing::info!(agent = %existing.id, "already registered, status {}", existing.status);
                existing
            }
            Err(e) => return Err(e),
        };
        Ok(())
    }

    async fn retrieve(&mut self) -> Result<()> {
        let agent = self.dispatcher.agents_get(&self.info.id).await?;
        if agent.status != self.info.status {
            tracing::info!(agent = %agent.id, "status {} -> {}", self.info.status, agent.status);
        }
        self.info = agent;
        Ok(())
    }

    async fn poll_jobs(&mut self, cancel: &CancellationToken) -> Result<Duration> {
        let jobs = match self.dispatcher.agents_jobs(&self.info.id).await {
            Ok(jobs) => jobs,
            Err(e) => {
                // 可能已被封禁，刷新状态后再退避
                if let Err(refresh) = self.retrieve().await {
                    tracing::debug!("status refresh failed: {}", refresh);
                }
                return Err(e);
            }
        };

        if jobs.is_empty() {
            return Ok(self.config.backoff);
        }

        for job in jobs {
            match self.handle_job(job, cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => tracing::error!(agent = %self.info.id, "job failed: {}", e),
            }
        }
        Ok(self.config.backoff)
    }

    pub async fn handle_job(&self, job: Job, cancel: &CancellationToken) -> Result<()> {
        match job.cmd {
            JobCmd::Repeat => Ok(()),
            JobCmd::Scan => {
                let session = job
                    .scan
                    .ok_or_else(|| Error::Protocol("scan job without session".to_string()))?;
                self.handle_scan(session, cancel).await
            }
        }
    }
}
