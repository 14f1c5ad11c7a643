//! 会话 / Scan 状态机
//!
//! 每条合法迁移对应一个方法，非法迁移返回 [`Error::InvalidTransition`]。
//! Scan 的状态只由其根会话推导（见 [`Scan::update_session`]）。

use chrono::Utc;

use crate::error::{Error, Result};
use crate::types::{Scan, ScanStatus, Session, SessionStatus};

/// [`Scan::update_session`] 的结果，决定持久化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanChange {
    /// 聚合状态变化：整体重写 Scan
    Scan,
    /// 仅会话字段变化：定向写入会话 + `updated`
    Session,
}

impl Session {
    /// `Created → Queued`（仅 Scheduler）
    pub fn queue(&mut self) -> Result<()> {
        self.transition(&[SessionStatus::Created], SessionStatus::Queued)
    }

    /// `Queued → Working`；嵌套会话不经过 Scheduler，允许 `Created → Working`
    pub fn start(&mut self) -> Result<()> {
        if self.status == SessionStatus::Created && self.is_root() {
            return Err(self.invalid(SessionStatus::Working));
        }
        self.transition(
            &[SessionStatus::Created, SessionStatus::Queued],
            SessionStatus::Working,
        )
    }

    /// `Working → Paused`
    pub fn pause(&mut self) -> Result<()> {
        self.transition(&[SessionStatus::Working], SessionStatus::Paused)
    }

    /// `Paused → Working`
    pub fn resume(&mut self) -> Result<()> {
        self.transition(&[SessionStatus::Paused], SessionStatus::Working)
    }

    /// `Working → Finished`
    pub fn finish(&mut self) -> Result<()> {
        self.transition(&[SessionStatus::Working], SessionStatus::Finished)
    }

    /// 任意非终态 → `Failed`
    pub fn fail(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid(SessionStatus::Failed));
        }
        self.set_status(SessionStatus::Failed);
        Ok(())
    }

    fn transition(&mut self, from: &[SessionStatus], to: SessionStatus) -> Result<()> {
        if !from.contains(&self.status) {
            return Err(self.invalid(to));
        }
        self.set_status(to);
        Ok(())
    }

    fn invalid(&self, to: SessionStatus) -> Error {
        Error::InvalidTransition {
            from: self.status,
            to,
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.stamp();
    }

    /// 首次到达某状态时记录时间戳
    pub(crate) fn stamp(&mut self) {
        let now = Utc::now();
        match self.status {
            SessionStatus::Queued => {
                self.queued.get_or_insert(now);
            }
            SessionStatus::Working => {
                self.started.get_or_insert(now);
            }
            SessionStatus::Finished | SessionStatus::Failed => {
                self.finished.get_or_insert(now);
            }
            SessionStatus::Created | SessionStatus::Paused => {}
        }
    }
}

impl Scan {
    /// 合并一个根会话的新状态，并同步 Scan 聚合状态
    ///
    /// 嵌套会话不经过这里，它们独立更新。
    pub fn update_session(&mut self, session: &Session) -> Result<ScanChange> {
        if !session.is_root() {
            return Err(Error::Protocol(format!(
                "session {} is nested, update it through its parent",
                session.id
            )));
        }

        let index = self
            .sessions
            .iter()
            .position(|s| s.id == session.id)
            .ok_or_else(|| {
                Error::NotFound(format!("session {} in scan {}", session.id, self.id))
            })?;

        let mut updated = session.clone();
        updated.stamp();
        self.sessions[index] = updated;

        let last = index + 1 == self.sessions.len();
        let before = self.status;

        let next = match session.status {
            SessionStatus::Queued
                if matches!(self.status, ScanStatus::Created | ScanStatus::Working) =>
            {
                Some(ScanStatus::Queued)
            }
            SessionStatus::Working if self.status != ScanStatus::Working => {
                Some(ScanStatus::Working)
            }
            SessionStatus::Paused if self.status == ScanStatus::Working => Some(ScanStatus::Paused),
            SessionStatus::Failed => Some(ScanStatus::Failed),
            SessionStatus::Finished if last => Some(ScanStatus::Finished),
            _ => None,
        };

        if let Some(status) = next {
            // 终态不回退
            if !self.status.is_terminal() {
                self.status = status;
            }
        }

        let now = Utc::now();
        match self.status {
            ScanStatus::Queued => {
                self.queued.get_or_insert(now);
            }
            ScanStatus::Working => {
                self.started.get_or_insert(now);
            }
            ScanStatus::Finished | ScanStatus::Failed => {
                self.finished.get_or_insert(now);
            }
            _ => {}
        }
        self.updated = now;

        if self.status != before {
            tracing::debug!(
                scan = %self.id,
                session = %session.id,
                "scan status {} -> {}",
                before,
                self.status
            );
            Ok(ScanChange::Scan)
        } else {
            Ok(ScanChange::Session)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Step;
    use serde_json::json;

    fn scan_with(n: usize) -> Scan {
        let mut scan = Scan::new("scan-1", "plan-1", "example.org");
        for i in 0..n {
            scan.push_step(format!("s{}", i + 1), Step::new("nmap", json!({})));
        }
        scan
    }

    #[test]
    fn test_session_legal_path() {
        let mut scan = scan_with(1);
        let session = &mut scan.sessions[0];

        session.queue().unwrap();
        assert!(session.queued.is_some());
        session.start().unwrap();
        session.pause().unwrap();
        session.resume().unwrap();
        session.finish().unwrap();
        assert_eq!(session.status, SessionStatus::Finished);
        assert!(session.started.is_some());
        assert!(session.finished.is_some());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut scan = scan_with(1);
        let session = &mut scan.sessions[0];

        // 根会话必须先排队
        assert!(matches!(
            session.start(),
            Err(Error::InvalidTransition {
                from: SessionStatus::Created,
                to: SessionStatus::Working
            })
        ));
        assert!(session.finish().is_err());

        session.queue().unwrap();
        assert!(session.queue().is_err());
        session.fail().unwrap();
        // 终态
        assert!(session.fail().is_err());
        assert!(session.resume().is_err());
    }

    #[test]
    fn test_nested_session_starts_from_created() {
        let scan = scan_with(1);
        let mut child = Session::child_of(&scan.sessions[0], "c1", Step::new("httpx", json!({})));
        child.start().unwrap();
        assert_eq!(child.status, SessionStatus::Working);
    }

    #[test]
    fn test_timestamps_stamped_once() {
        let mut scan = scan_with(1);
        let session = &mut scan.sessions[0];
        session.queue().unwrap();
        session.start().unwrap();
        let started = session.started;
        session.pause().unwrap();
        session.resume().unwrap();
        assert_eq!(session.started, started);
    }

    #[test]
    fn test_update_session_drives_scan_status() {
        let mut scan = scan_with(2);

        let mut s1 = scan.sessions[0].clone();
        s1.queue().unwrap();
        assert_eq!(scan.update_session(&s1).unwrap(), ScanChange::Scan);
        assert_eq!(scan.status, ScanStatus::Queued);
        assert!(scan.queued.is_some());

        s1.start().unwrap();
        assert_eq!(scan.update_session(&s1).unwrap(), ScanChange::Scan);
        assert_eq!(scan.status, ScanStatus::Working);

        // 第一个会话完成，但不是最后一个
        s1.finish().unwrap();
        assert_eq!(scan.update_session(&s1).unwrap(), ScanChange::Session);
        assert_eq!(scan.status, ScanStatus::Working);

        // 第二个会话排队：Working → Queued
        let mut s2 = scan.sessions[1].clone();
        s2.queue().unwrap();
        assert_eq!(scan.update_session(&s2).unwrap(), ScanChange::Scan);
        assert_eq!(scan.status, ScanStatus::Queued);

        s2.start().unwrap();
        scan.update_session(&s2).unwrap();
        s2.finish().unwrap();
        assert_eq!(scan.update_session(&s2).unwrap(), ScanChange::Scan);
        assert_eq!(scan.status, ScanStatus::Finished);
        assert!(scan.finished.is_some());
    }

    #[test]
    fn test_failed_session_fails_scan() {
        let mut scan = scan_with(3);
        let mut s1 = scan.sessions[0].clone();
        s1.queue().unwrap();
        scan.update_session(&s1).unwrap();
        s1.fail().unwrap();

        assert_eq!(scan.update_session(&s1).unwrap(), ScanChange::Scan);
        assert_eq!(scan.status, ScanStatus::Failed);

        // 终态不回退
        let mut s2 = scan.sessions[1].clone();
        s2.queue().unwrap();
        assert_eq!(scan.update_session(&s2).unwrap(), ScanChange::Session);
        assert_eq!(scan.status, ScanStatus::Failed);
    }

    #[test]
    fn test_update_unknown_session() {
        let mut scan = scan_with(1);
        let stranger = Session::new("other", "scan-1", Step::new("nmap", json!({})));
        assert!(scan.update_session(&stranger).unwrap_err().is_not_found());

        let nested = Session::child_of(&scan.sessions[0], "c1", Step::new("x", json!({})));
        assert!(matches!(scan.update_session(&nested), Err(Error::Protocol(_))));
    }
}
