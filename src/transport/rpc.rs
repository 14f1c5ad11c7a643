//! 请求 / 响应多路复用
//!
//! [`Transport`] 建在 [`Loop`] 之上：
//! - 会话表（消息 ID → 一次性等待者），由一把互斥锁保护
//! - 对端主动发来的 Request 交给 [`RequestHandler`]，每个请求一个并发任务，
//!   慢的处理器不会阻塞接收循环
//!
//! 响应只按 ID 关联，并发请求之间没有顺序保证。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::conn::{Loop, LoopState};
use crate::error::{Error, Result};
use crate::protocol::{Command, Message};

/// 对端请求处理器
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// 返回值作为 Response 的 data；返回错误时回复 Error 消息
    async fn handle(&self, data: serde_json::Value) -> Result<serde_json::Value>;
}

/// 等待者收到对端回复，或 serve 退出时的失败原因
type Waiters = Mutex<HashMap<u64, oneshot::Sender<Result<Message>>>>;

/// 等待者守卫：取消或出错时从会话表移除
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.id);
    }
}

/// 双工 RPC 通道
pub struct Transport {
    outbound: mpsc::Sender<Message>,
    inbound: Mutex<Option<mpsc::Receiver<Message>>>,
    waiters: Waiters,
    /// 连接内的消息 ID 计数器
    next_id: AtomicU64,
    state: Arc<LoopState>,
}

impl Transport {
    pub fn new(conn: Loop) -> Self {
        Self {
            outbound: conn.outbound,
            inbound: Mutex::new(Some(conn.inbound)),
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            state: conn.state,
        }
    }

    /// 接收循环，直到取消或连接终止
    ///
    /// 取消时返回 `Ok(())`；连接终止时返回终止原因。退出时所有在途请求都会失败：
    /// 取消时为 [`Error::Cancelled`]，否则为连接终止原因。
    /// 每个 Transport 只能 serve 一次。
    pub async fn serve(&self, cancel: &CancellationToken, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let mut inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| Error::Transport("transport is already serving".to_string()))?;

        let result = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                msg = inbound.recv() => msg,
            };
            match msg {
                Some(msg) => self.dispatch(msg, &handler),
                None => break Err(self.state.failure()),
            }
        };

        match &result {
            Ok(()) => self.fail_waiters(|| Error::Cancelled),
            Err(_) => self.fail_waiters(|| self.state.failure()),
        }
        result
    }

    /// 唤醒所有在途请求
    fn fail_waiters(&self, reason: impl Fn() -> Error) {
        let waiters: Vec<_> = self.waiters.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(reason()));
        }
    }

    fn dispatch(&self, msg: Message, handler: &Arc<dyn RequestHandler>) {
        match msg.cmd {
            Command::Request => {
                let handler = handler.clone();
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let id = msg.id;
                    let reply = match handler.handle(msg.data).await {
                        Ok(data) => Message::response(id, data),
                        Err(e) => {
                            tracing::debug!("handler failed: id={}, {}", id, e);
                            Message::error(id, e.to_string())
                        }
                    };
                    if outbound.send(reply).await.is_err() {
                        tracing::debug!("connection gone before reply: id={}", id);
                    }
                });
            }
            Command::Response | Command::Error => self.deliver(msg),
            Command::Unknown(cmd) => {
                if self.waiters.lock().contains_key(&msg.id) {
                    // 关联到在途请求：由 request() 报告协议错误
                    self.deliver(msg);
                } else {
                    tracing::warn!("unknown command {}: id={}", cmd, msg.id);
                    let reply = Message::error(msg.id, format!("unknown command {}", cmd));
                    if self.outbound.try_send(reply).is_err() {
                        tracing::debug!("failed to report unknown command: id={}", msg.id);
                    }
                }
            }
        }
    }

    fn deliver(&self, msg: Message) {
        let waiter = self.waiters.lock().remove(&msg.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(msg));
            }
            None => tracing::warn!("no waiter for response: id={}", msg.id),
        }
    }

    /// 发送请求并等待对应 ID 的响应
    ///
    /// 需要同时有 [`Transport::serve`] 在运行。取消只放弃等待，不撤回对端已接受的工作。
    pub async fn request<S, R>(&self, cancel: &CancellationToken, send: &S) -> Result<R>
    where
        S: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.state.is_closed() {
            return Err(self.state.failure());
        }

        let data = serde_json::to_value(send)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            id,
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sent = self.outbound.send(Message::request(id, data)) => {
                if sent.is_err() {
                    return Err(self.state.failure());
                }
            }
        }
        tracing::trace!("➡️ request sent: id={}", id);

        let reply = tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| self.state.failure())??,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.state.wait_closed() => return Err(self.state.failure()),
        };

        match reply.cmd {
            Command::Response => Ok(serde_json::from_value(reply.data)?),
            Command::Error => Err(Error::Remote(reply.error_message())),
            other => Err(Error::Protocol(format!(
                "unexpected command {} for id={}",
                u8::from(other),
                id
            ))),
        }
    }

    /// 在途请求数
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// 主动关闭底层连接
    pub fn close(&self) {
        self.state.close(None);
    }
}
