//! 调度器
//!
//! 决定下一个可以执行的根会话：
//! - 同一 Scan 内严格按顺序执行
//! - 每个 Scan 同时最多一个在途作业（`Queued` / `Working` / `Paused`）
//! - 每次调用最多派发一个会话
//!
//! [`MemoryScheduler`] 把全部状态放在进程内存中，重启会丢失尚未派发的排队状态，
//! 也不能多实例部署。接口本身允许基于持久层的实现替换它。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::store::{ScanStore, StoreError};
use crate::types::{Scan, ScanStatus, Session, SessionStatus};

/// 调度接口
pub trait Scheduler: Send + Sync {
    /// 加入一个 Scan
    fn add_scan(&self, scan: Scan);

    /// 用最新状态覆盖（upsert）
    fn update_scan(&self, scan: Scan);

    /// 取下一个可执行会话；没有可执行的返回 `None`
    fn get_session(&self) -> Result<Option<Session>>;
}

/// 一次派发的结果
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// 已置为 `Queued` 的会话
    pub session: Session,
    pub scan_before: ScanStatus,
    pub scan_after: ScanStatus,
}

/// 对单个 Scan 检查后的决定
enum Verdict {
    /// 派发 sessions[index]
    Dispatch(usize),
    /// 有在途作业，跳过
    Busy,
    /// 已结束或失败，移出队列
    Drop(&'static str),
}

/// 内存调度器
pub struct MemoryScheduler {
    scans: RwLock<HashMap<String, Scan>>,
    store: Arc<dyn ScanStore>,
}

impl MemoryScheduler {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self {
            scans: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn len(&self) -> usize {
        self.scans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.read().is_empty()
    }

    pub fn contains(&self, scan_id: &str) -> bool {
        self.scans.read().contains_key(scan_id)
    }

    /// 与 [`Scheduler::get_session`] 相同，但同时返回 Scan 状态变化
    pub fn next_dispatch(&self) -> Result<Option<Dispatch>> {
        let mut scans = self.scans.write();
        let mut dropped = Vec::new();
        let mut dispatched = None;

        for (id, scan) in scans.iter_mut() {
            let index = match inspect(scan) {
                Verdict::Dispatch(index) => index,
                Verdict::Busy => continue,
                Verdict::Drop(reason) => {
                    tracing::debug!(scan = %id, "scan leaves scheduler: {}", reason);
                    dropped.push(id.clone());
                    continue;
                }
            };

            let before = scan.status;
            let mut session = scan.sessions[index].clone();
            session.queue()?;

            match self.persist(scan, &session) {
                Ok(()) => {
                    tracing::info!(scan = %id, session = %session.id, "📤 session queued");
                    dispatched = Some(Dispatch {
                        session,
                        scan_before: before,
                        scan_after: scan.status,
                    });
                    break;
                }
                Err(StoreError::ScanNotFound(_)) => {
                    tracing::info!(scan = %id, "scan deleted concurrently, dropping");
                    dropped.push(id.clone());
                }
                Err(StoreError::SessionNotFound(sid)) => {
                    tracing::warn!(scan = %id, session = %sid, "session missing in storage, dropping scan");
                    dropped.push(id.clone());
                }
                Err(StoreError::Backend(e)) => {
                    tracing::error!(scan = %id, "failed to persist queued session, dropping scan: {}", e);
                    dropped.push(id.clone());
                }
            }
        }

        for id in dropped {
            scans.remove(&id);
        }

        Ok(dispatched)
    }

    fn persist(&self, scan: &mut Scan, session: &Session) -> std::result::Result<(), StoreError> {
        let change = scan
            .update_session(session)
            .map_err(|_| StoreError::SessionNotFound(session.id.clone()))?;
        match change {
            crate::scan::ScanChange::Scan => self.store.update(scan),
            crate::scan::ScanChange::Session => self.store.update_session(scan, session),
        }
    }
}

/// 顺序遍历根会话，决定该 Scan 是否有可派发的会话
fn inspect(scan: &Scan) -> Verdict {
    for (index, session) in scan.sessions.iter().enumerate() {
        match session.status {
            SessionStatus::Created => return Verdict::Dispatch(index),
            SessionStatus::Queued | SessionStatus::Working | SessionStatus::Paused => {
                return Verdict::Busy
            }
            SessionStatus::Finished => continue,
            SessionStatus::Failed => return Verdict::Drop("session failed"),
        }
    }
    Verdict::Drop("all sessions finished")
}

impl Scheduler for MemoryScheduler {
    fn add_scan(&self, scan: Scan) {
        tracing::debug!(scan = %scan.id, sessions = scan.sessions.len(), "scan added to scheduler");
        self.scans.write().insert(scan.id.clone(), scan);
    }

    fn update_scan(&self, scan: Scan) {
        self.scans.write().insert(scan.id.clone(), scan);
    }

    fn get_session(&self) -> Result<Option<Session>> {
        Ok(self.next_dispatch()?.map(|d| d.session))
    }
}
