//! 连接循环
//!
//! [`Loop`] 拥有一条原始连接，对外暴露两个独立队列：入站（已解码消息）与出站。
//! 每条连接一个读任务、一个写任务。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::protocol::Message;

/// 队列容量
const QUEUE_CAPACITY: usize = 100;

/// 连接状态（读写任务共享）
#[derive(Default)]
pub(crate) struct LoopState {
    closed: CancellationToken,
    /// 第一次 I/O 失败的原因；正常关闭时为空
    error: Mutex<Option<String>>,
}

impl LoopState {
    pub(crate) fn close(&self, error: Option<String>) {
        if let Some(e) = error {
            let mut slot = self.error.lock();
            if slot.is_none() {
                tracing::debug!("🔌 Loop failed: {}", e);
                *slot = Some(e);
            }
        }
        self.closed.cancel();
    }

    /// 连接终止的原因
    pub(crate) fn failure(&self) -> Error {
        match self.error.lock().as_ref() {
            Some(e) => Error::Transport(e.clone()),
            None => Error::ConnectionClosed,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 等待连接终止
    pub(crate) async fn wait_closed(&self) {
        self.closed.cancelled().await
    }
}

/// 一条连接的读写循环
pub struct Loop {
    pub(crate) inbound: mpsc::Receiver<Message>,
    pub(crate) outbound: mpsc::Sender<Message>,
    pub(crate) state: Arc<LoopState>,
}

impl Loop {
    /// 基于字节流（Unix Socket / TCP / TLS / 内存管道），JSONL 分帧
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::channel::<Message>(QUEUE_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(QUEUE_CAPACITY);
        let state = Arc::new(LoopState::default());

        // 读任务
        let read_state = state.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    _ = read_state.closed.cancelled() => break,
                    read = reader.read_line(&mut line) => read,
                };
                match read {
                    Ok(0) => {
                        read_state.close(None);
                        break;
                    }
                    Ok(_) => {
                        let raw = line.trim();
                        if raw.is_empty() {
                            continue;
                        }
                        match Message::parse(raw) {
                            Ok(msg) => {
                                if in_tx.send(msg).await.is_err() {
                                    read_state.close(None);
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("解析消息失败，已丢弃: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        read_state.close(Some(format!("read failed: {}", e)));
                        break;
                    }
                }
            }
        });

        // 写任务
        let write_state = state.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = write_state.closed.cancelled() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let line = match msg.encode() {
                    Ok(json) => format!("{}\n", json),
                    Err(e) => {
                        tracing::error!("序列化消息失败: id={}, {}", msg.id, e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    write_state.close(Some(format!("write failed: {}", e)));
                    break;
                }
                if let Err(e) = writer.flush().await {
                    write_state.close(Some(format!("flush failed: {}", e)));
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            inbound: in_rx,
            outbound: out_tx,
            state,
        }
    }

    /// 基于 WebSocket，每个文本帧一条消息
    #[cfg(feature = "websocket")]
    pub fn from_websocket<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as Frame;

        let (mut sink, mut stream) = ws.split();
        let (in_tx, in_rx) = mpsc::channel::<Message>(QUEUE_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(QUEUE_CAPACITY);
        let state = Arc::new(LoopState::default());

        let read_state = state.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = read_state.closed.cancelled() => break,
                    frame = stream.next() => frame,
                };
                let parsed = match frame {
                    None | Some(Ok(Frame::Close(_))) => {
                        read_state.close(None);
                        break;
                    }
                    Some(Ok(Frame::Text(text))) => Message::parse(text.as_str()),
                    Some(Ok(Frame::Binary(bytes))) => serde_json::from_slice(&bytes).map_err(Error::from),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        read_state.close(Some(format!("websocket read failed: {}", e)));
                        break;
                    }
                };
                match parsed {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            read_state.close(None);
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("解析 WebSocket 消息失败，已丢弃: {}", e),
                }
            }
        });

        let write_state = state.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = write_state.closed.cancelled() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let json = match msg.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("序列化消息失败: id={}, {}", msg.id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Frame::text(json)).await {
                    write_state.close(Some(format!("websocket write failed: {}", e)));
                    break;
                }
            }
            let _ = sink.close().await;
        });

        Self {
            inbound: in_rx,
            outbound: out_tx,
            state,
        }
    }

    /// 主动关闭连接
    pub fn close(&self) {
        self.state.close(None);
    }
}
