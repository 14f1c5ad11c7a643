//! 进程内 Dispatcher
//!
//! 以 [`MemoryStore`] 为持久层、[`MemoryScheduler`] 为调度器，
//! 同时维护 Agent 注册表、插件目录、报告与文件。所有状态变化经 [`Broadcaster`] 通知。
//!
//! 嵌套会话不经过 Scheduler：`session_add_child` 创建后进入子会话队列，
//! `agents_jobs` 优先派发它们（父会话正阻塞等待）。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::DispatcherApi;
use crate::error::{Error, Result};
use crate::events::{Broadcaster, EventType, StatusEvent};
use crate::scheduler::{MemoryScheduler, Scheduler};
use crate::store::{save_session_update, MemoryStore, ScanStore};
use crate::types::{
    AgentInfo, AgentStatus, FileBlob, Job, Plugin, Report, Scan, Session, SessionStatus, Step,
};

/// 进程内 Dispatcher
pub struct LocalDispatcher {
    store: Arc<MemoryStore>,
    scheduler: MemoryScheduler,
    broadcaster: Arc<Broadcaster>,
    agents: RwLock<HashMap<String, AgentInfo>>,
    plugins: RwLock<Vec<Plugin>>,
    /// 会话 ID → 报告
    reports: RwLock<HashMap<String, Report>>,
    files: RwLock<HashMap<String, FileBlob>>,
    /// 待派发的嵌套会话（scan, session）
    children: Mutex<VecDeque<(String, String)>>,
    /// 串行化 Scan 的读-改-写
    write_lock: Mutex<()>,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let scheduler = MemoryScheduler::new(store.clone());
        Self {
            store,
            scheduler,
            broadcaster: Broadcaster::new(),
            agents: RwLock::new(HashMap::new()),
            plugins: RwLock::new(Vec::new()),
            reports: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            children: Mutex::new(VecDeque::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// 保存并开始调度一个 Scan
    pub fn add_scan(&self, scan: Scan) {
        tracing::info!(scan = %scan.id, "📋 scan submitted with {} sessions", scan.sessions.len());
        self.store.insert(scan.clone());
        self.scheduler.add_scan(scan);
    }

    /// 删除 Scan（调度器会在下次派发时发现并丢弃它）
    pub fn remove_scan(&self, id: &str) -> Option<Scan> {
        self.store.remove(id)
    }

    pub fn scan(&self, id: &str) -> Option<Scan> {
        self.store.get(id)
    }

    pub fn scheduler(&self) -> &MemoryScheduler {
        &self.scheduler
    }

    pub fn add_plugin(&self, plugin: Plugin) {
        self.plugins.write().push(plugin);
    }

    pub fn add_file(&self, id: impl Into<String>, file: FileBlob) {
        self.files.write().insert(id.into(), file);
    }

    pub fn report(&self, session: &str) -> Option<Report> {
        self.reports.read().get(session).cloned()
    }

    pub fn agent(&self, id: &str) -> Option<AgentInfo> {
        self.agents.read().get(id).cloned()
    }

    /// 批准 Agent
    pub fn approve_agent(&self, id: &str) -> Result<()> {
        self.set_agent_status(id, AgentStatus::Approved)
    }

    /// 封禁 Agent
    pub fn block_agent(&self, id: &str) -> Result<()> {
        self.set_agent_status(id, AgentStatus::Blocked)
    }

    fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", id)))?;
        tracing::info!(agent = %id, "agent status {} -> {}", agent.status, status);
        agent.status = status;
        Ok(())
    }

    /// 订阅状态变更
    pub fn subscribe(&self, events: &[EventType]) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(100);
        self.broadcaster.subscribe(tx, events);
        rx
    }

    fn load_scan(&self, id: &str) -> Result<Scan> {
        self.store
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("scan {}", id)))
    }

    /// 写入嵌套会话（不影响 Scan 聚合状态）
    fn write_nested(&self, scan: &mut Scan, session: &Session) -> Result<()> {
        let slot = scan
            .find_session_mut(&session.id)
            .ok_or_else(|| Error::NotFound(format!("session {}", session.id)))?;
        *slot = session.clone();
        slot.stamp();
        let stored = slot.clone();
        self.store
            .update_session(scan, &stored)
            .map_err(|e| Error::NotFound(e.to_string()))?;
        self.refresh_scheduler(scan);
        Ok(())
    }

    /// 让调度器持有的副本跟上会话树的变化
    fn refresh_scheduler(&self, scan: &Scan) {
        if self.scheduler.contains(&scan.id) {
            self.scheduler.update_scan(scan.clone());
        }
    }

    /// 取出下一个仍存在且处于 Created 的嵌套会话并置为 Queued
    fn next_child(&self) -> Result<Option<Session>> {
        loop {
            let Some((scan_id, session_id)) = self.children.lock().pop_front() else {
                return Ok(None);
            };
            let Some(mut scan) = self.store.get(&scan_id) else {
                tracing::info!(scan = %scan_id, "scan gone, dropping nested session {}", session_id);
                continue;
            };
            let Some(mut child) = scan.find_session(&session_id).cloned() else {
                continue;
            };
            if child.queue().is_err() {
                continue;
            }
            self.write_nested(&mut scan, &child)?;
            self.broadcaster.publish(StatusEvent::SessionStatus {
                scan: scan_id,
                session: session_id,
                from: SessionStatus::Created,
                to: SessionStatus::Queued,
            });
            return Ok(Some(child));
        }
    }

    fn publish_changes(&self, before: &Scan, after: &Scan, session: &Session) {
        let old = before.find_session(&session.id).map(|s| s.status);
        if let Some(from) = old {
            if from != session.status {
                self.broadcaster.publish(StatusEvent::SessionStatus {
                    scan: after.id.clone(),
                    session: session.id.clone(),
                    from,
                    to: session.status,
                });
            }
        }
        if before.status != after.status {
            self.broadcaster.publish(StatusEvent::ScanStatus {
                scan: after.id.clone(),
                from: before.status,
                to: after.status,
            });
        }
    }
}

impl Default for LocalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatcherApi for LocalDispatcher {
    async fn agents_create(&self, agent: &AgentInfo) -> Result<AgentInfo> {
        let mut agents = self.agents.write();
        if agents
            .values()
            .any(|a| a.name == agent.name && a.agent_type == agent.agent_type)
        {
            return Err(Error::Conflict(format!(
                "agent {}/{} already registered",
                agent.agent_type, agent.name
            )));
        }

        let mut created = agent.clone();
        created.id = uuid::Uuid::new_v4().to_string();
        created.status = AgentStatus::Registered;
        agents.insert(created.id.clone(), created.clone());
        tracing::info!(agent = %created.id, "🆕 agent registered: {}/{}", created.agent_type, created.name);
        Ok(created)
    }

    async fn agents_list(&self, name: &str, agent_type: &str) -> Result<Vec<AgentInfo>> {
        Ok(self
            .agents
            .read()
            .values()
            .filter(|a| a.name == name && a.agent_type == agent_type)
            .cloned()
            .collect())
    }

    async fn agents_get(&self, id: &str) -> Result<AgentInfo> {
        self.agent(id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", id)))
    }

    async fn agents_update(&self, agent: &AgentInfo) -> Result<AgentInfo> {
        let mut agents = self.agents.write();
        let stored = agents
            .get_mut(&agent.id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent.id)))?;
        // 状态只能由 Dispatcher 修改
        stored.name = agent.name.clone();
        stored.agent_type = agent.agent_type.clone();
        Ok(stored.clone())
    }

    async fn agents_jobs(&self, agent_id: &str) -> Result<Vec<Job>> {
        let agent = self.agents_get(agent_id).await?;
        if agent.status != AgentStatus::Approved {
            return Err(Error::Api {
                status: 403,
                message: format!("agent {} is {}", agent_id, agent.status),
            });
        }

        let _guard = self.write_lock.lock();
        if let Some(child) = self.next_child()? {
            tracing::debug!(agent = %agent_id, session = %child.id, "nested job handed out");
            return Ok(vec![Job::scan(child)]);
        }

        let Some(dispatch) = self.scheduler.next_dispatch()? else {
            return Ok(Vec::new());
        };

        let session = dispatch.session;
        self.broadcaster.publish(StatusEvent::SessionStatus {
            scan: session.scan.clone(),
            session: session.id.clone(),
            from: SessionStatus::Created,
            to: session.status,
        });
        if dispatch.scan_before != dispatch.scan_after {
            self.broadcaster.publish(StatusEvent::ScanStatus {
                scan: session.scan.clone(),
                from: dispatch.scan_before,
                to: dispatch.scan_after,
            });
        }

        tracing::debug!(agent = %agent_id, session = %session.id, "job handed out");
        Ok(vec![Job::scan(session)])
    }

    async fn plugins_get(&self, name: &str, version: Option<&str>) -> Result<Plugin> {
        self.plugins
            .read()
            .iter()
            .rev()
            .find(|p| p.name == name && version.map_or(true, |v| p.version == v))
            .cloned()
            .ok_or_else(|| match version {
                Some(v) => Error::NotFound(format!("plugin {}@{}", name, v)),
                None => Error::NotFound(format!("plugin {}", name)),
            })
    }

    async fn plugins_list(&self, name: &str) -> Result<Vec<Plugin>> {
        Ok(self
            .plugins
            .read()
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect())
    }

    async fn session_update(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock();
        let before = self.load_scan(&session.scan)?;
        let mut scan = before.clone();

        // 子会话列表由 session_add_child 维护，调用方手里的副本可能已过期
        let mut session = session.clone();
        if let Some(stored) = before.find_session(&session.id) {
            session.children = stored.children.clone();
        }

        if session.is_root() {
            save_session_update(self.store.as_ref(), &mut scan, &session)?;
            self.scheduler.update_scan(scan.clone());
        } else {
            self.write_nested(&mut scan, &session)?;
        }

        self.publish_changes(&before, &scan, &session);
        Ok(())
    }

    async fn session_add_child(&self, parent: &Session, step: &Step) -> Result<Session> {
        let _guard = self.write_lock.lock();
        let mut scan = self.load_scan(&parent.scan)?;
        let slot = scan
            .find_session_mut(&parent.id)
            .ok_or_else(|| Error::NotFound(format!("session {}", parent.id)))?;

        let child = Session::child_of(slot, uuid::Uuid::new_v4().to_string(), step.clone());
        slot.children.push(child.clone());
        let stored_parent = slot.clone();
        self.store
            .update_session(&scan, &stored_parent)
            .map_err(|e| Error::NotFound(e.to_string()))?;
        self.refresh_scheduler(&scan);
        self.children
            .lock()
            .push_back((child.scan.clone(), child.id.clone()));

        tracing::info!(scan = %scan.id, parent = %parent.id, child = %child.id, "🧩 nested session created for {}", step.plugin);
        Ok(child)
    }

    async fn session_get(&self, scan: &str, session: &str) -> Result<Session> {
        self.load_scan(scan)?
            .find_session(session)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {}", session)))
    }

    async fn session_report_get(&self, _scan: &str, session: &str) -> Result<Report> {
        self.report(session)
            .ok_or_else(|| Error::NotFound(format!("report for session {}", session)))
    }

    async fn session_report_submit(&self, session: &Session, report: &Report) -> Result<()> {
        self.reports
            .write()
            .insert(session.id.clone(), report.clone());
        Ok(())
    }

    async fn files_download(&self, id: &str) -> Result<FileBlob> {
        self.files
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))
    }
}
