//! 持久化协作者
//!
//! 核心只依赖 [`ScanStore`] 这个窄接口；[`MemoryStore`] 是进程内实现。

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;

use crate::scan::ScanChange;
use crate::types::{Scan, Session};

/// 持久化错误
///
/// `ScanNotFound`（Scan 已被并发删除，属预期）与 `SessionNotFound`（可能是 bug）分开表示。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("scan not found: {0}")]
    ScanNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

/// Scan 持久化接口
pub trait ScanStore: Send + Sync {
    /// 定向写入一个会话（含嵌套会话）并刷新 `updated`
    fn update_session(&self, scan: &Scan, session: &Session) -> Result<(), StoreError>;

    /// 整体重写 Scan
    fn update(&self, scan: &Scan) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Option<Scan>;
}

/// 执行 UpdateSession 并按变化范围持久化
///
/// 聚合状态变化时整体重写，否则只写会话。
pub fn save_session_update(
    store: &dyn ScanStore,
    scan: &mut Scan,
    session: &Session,
) -> crate::Result<ScanChange> {
    let change = scan.update_session(session)?;
    let result = match change {
        ScanChange::Scan => store.update(scan),
        ScanChange::Session => store.update_session(scan, session),
    };
    result.map_err(|e| match e {
        StoreError::ScanNotFound(_) | StoreError::SessionNotFound(_) => {
            crate::Error::NotFound(e.to_string())
        }
        StoreError::Backend(msg) => crate::Error::Other(anyhow::anyhow!(msg)),
    })?;
    Ok(change)
}

/// 内存实现
#[derive(Default)]
pub struct MemoryStore {
    scans: RwLock<HashMap<String, Scan>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新建 Scan（扫描创建流程在核心之外，这里只负责保存）
    pub fn insert(&self, scan: Scan) {
        self.scans.write().insert(scan.id.clone(), scan);
    }

    pub fn remove(&self, id: &str) -> Option<Scan> {
        self.scans.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.scans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.read().is_empty()
    }
}

impl ScanStore for MemoryStore {
    fn update_session(&self, scan: &Scan, session: &Session) -> Result<(), StoreError> {
        let mut scans = self.scans.write();
        let stored = scans
            .get_mut(&scan.id)
            .ok_or_else(|| StoreError::ScanNotFound(scan.id.clone()))?;
        let slot = stored
            .find_session_mut(&session.id)
            .ok_or_else(|| StoreError::SessionNotFound(session.id.clone()))?;
        *slot = session.clone();
        stored.updated = Utc::now();
        Ok(())
    }

    fn update(&self, scan: &Scan) -> Result<(), StoreError> {
        let mut scans = self.scans.write();
        let stored = scans
            .get_mut(&scan.id)
            .ok_or_else(|| StoreError::ScanNotFound(scan.id.clone()))?;
        *stored = scan.clone();
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Scan> {
        self.scans.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SessionStatus, Step};
    use serde_json::json;

    fn scan() -> Scan {
        let mut scan = Scan::new("scan-1", "plan", "example.org");
        scan.push_step("s1", Step::new("nmap", json!({})));
        scan.push_step("s2", Step::new("nuclei", json!({})));
        scan
    }

    #[test]
    fn test_save_session_update_targeted_write() {
        let store = MemoryStore::new();
        let mut scan = scan();
        store.insert(scan.clone());

        let mut s1 = scan.sessions[0].clone();
        s1.queue().unwrap();
        assert_eq!(save_session_update(&store, &mut scan, &s1).unwrap(), ScanChange::Scan);
        assert_eq!(store.get("scan-1").unwrap().status, SessionStatus::Queued);

        s1.start().unwrap();
        save_session_update(&store, &mut scan, &s1).unwrap();
        s1.finish().unwrap();
        // 非最后一个会话完成：只写会话
        assert_eq!(
            save_session_update(&store, &mut scan, &s1).unwrap(),
            ScanChange::Session
        );
        let stored = store.get("scan-1").unwrap();
        assert_eq!(stored.sessions[0].status, SessionStatus::Finished);
        assert_eq!(stored.status, SessionStatus::Working);
    }

    #[test]
    fn test_missing_scan_is_not_found() {
        let store = MemoryStore::new();
        let mut scan = scan();
        let mut s1 = scan.sessions[0].clone();
        s1.queue().unwrap();

        let err = save_session_update(&store, &mut scan, &s1).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            store.update_session(&scan, &s1),
            Err(StoreError::ScanNotFound("scan-1".to_string()))
        );
    }
}
