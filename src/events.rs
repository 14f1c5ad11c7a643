//! 状态变更通知
//!
//! 订阅者注册一个发送通道和关心的事件类型，之后无需轮询即可获知状态迁移。
//! 每个订阅者对每个事件最多收到一次，顺序与发布顺序一致；通道满时丢弃。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{ScanStatus, SessionStatus};

/// 订阅 ID
pub type SubscriberId = u64;

/// 事件类型（用于订阅）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ScanStatus,
    SessionStatus,
}

/// 状态迁移事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    ScanStatus {
        scan: String,
        from: ScanStatus,
        to: ScanStatus,
    },
    SessionStatus {
        scan: String,
        session: String,
        from: SessionStatus,
        to: SessionStatus,
    },
}

impl StatusEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            StatusEvent::ScanStatus { .. } => EventType::ScanStatus,
            StatusEvent::SessionStatus { .. } => EventType::SessionStatus,
        }
    }
}

/// 事件广播器
pub struct Broadcaster {
    /// 订阅关系：SubscriberId → 订阅的事件类型
    subscriptions: RwLock<HashMap<SubscriberId, HashSet<EventType>>>,
    /// SubscriberId → 发送通道
    senders: RwLock<HashMap<SubscriberId, mpsc::Sender<StatusEvent>>>,
    next_id: RwLock<SubscriberId>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册订阅者，返回订阅 ID
    pub fn subscribe(&self, sender: mpsc::Sender<StatusEvent>, events: &[EventType]) -> SubscriberId {
        let mut next_id = self.next_id.write();
        let id = *next_id;
        *next_id += 1;

        self.senders.write().insert(id, sender);
        self.subscriptions
            .write()
            .insert(id, events.iter().copied().collect());

        tracing::debug!("📡 Subscriber registered: id={}, events={:?}", id, events);
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.senders.write().remove(&id);
        self.subscriptions.write().remove(&id);
        tracing::debug!("📡 Subscriber removed: id={}", id);
    }

    /// 发布事件（非阻塞）
    pub fn publish(&self, event: StatusEvent) {
        let event_type = event.event_type();

        let targets: Vec<(SubscriberId, mpsc::Sender<StatusEvent>)> = {
            let subs = self.subscriptions.read();
            let senders = self.senders.read();

            subs.iter()
                .filter(|(_, subscribed)| subscribed.contains(&event_type))
                .filter_map(|(id, _)| senders.get(id).map(|s| (*id, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: event_type={:?}", event_type);
            return;
        }

        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("📡 Channel full, dropping event: subscriber={}", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            self.unsubscribe(id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.read().len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
        }
    }
}
