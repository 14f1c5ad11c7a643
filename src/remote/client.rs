//! Remote Plugin Client（插件进程侧）

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{ConnectInfo, Method, RequestV1, ResponseV1};
use crate::transport::{dial, Endpoint, Loop, RequestHandler, TlsConfig, Transport};
use crate::types::{FileBlob, Report, Step};

/// 应答 Server 推送的 Connect / Ping
struct ClientHandler {
    connected: watch::Sender<Option<ConnectInfo>>,
}

#[async_trait]
impl RequestHandler for ClientHandler {
    async fn handle(&self, data: serde_json::Value) -> Result<serde_json::Value> {
        let request: RequestV1 =
            serde_json::from_value(data).map_err(|e| Error::Protocol(e.to_string()))?;
        match request.method {
            Method::Connect => {
                let info = request
                    .connect
                    .ok_or_else(|| Error::Protocol("missing field connect".to_string()))?;
                tracing::debug!("Connect from agent {} for session {}", info.version, info.session);
                self.connected.send_replace(Some(info));
            }
            Method::Ping => {}
            other => {
                return Err(Error::Protocol(format!(
                    "method {} not served by plugin",
                    u8::from(other)
                )))
            }
        }
        Ok(serde_json::to_value(ResponseV1::default())?)
    }
}

/// 插件进程连接 Agent 的客户端，所有调用均为阻塞式请求
pub struct RemoteClient {
    transport: Arc<Transport>,
    connected: watch::Receiver<Option<ConnectInfo>>,
    cancel: CancellationToken,
}

impl RemoteClient {
    pub async fn connect(endpoint: &Endpoint, tls: &TlsConfig) -> Result<Self> {
        let conn = dial(endpoint, tls).await?;
        Ok(Self::from_loop(conn))
    }

    /// 使用 Agent 注入的 `SCANFLEET_ENDPOINT`
    pub async fn from_env() -> Result<Self> {
        let config = ClientConfig::from_env()?;
        tracing::debug!(session = ?config.session, "connecting to agent at {}", config.endpoint);
        Self::connect(&config.endpoint, &config.tls).await
    }

    /// 在已建立的连接上启动接收循环
    pub fn from_loop(conn: Loop) -> Self {
        let transport = Arc::new(Transport::new(conn));
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let handler: Arc<dyn RequestHandler> = Arc::new(ClientHandler { connected: tx });
        let serving = transport.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            match serving.serve(&token, handler).await {
                Ok(()) | Err(Error::ConnectionClosed) => tracing::debug!("remote client stopped"),
                Err(e) => tracing::warn!("remote client connection failed: {}", e),
            }
        });

        Self {
            transport,
            connected: rx,
            cancel,
        }
    }

    /// 阻塞直到收到 Server 的 Connect 握手
    pub async fn wait_for_connection(&self) -> Result<ConnectInfo> {
        let mut rx = self.connected.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(info) = current {
                return Ok(info);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::ConnectionClosed);
                    }
                }
            }
        }
    }

    async fn call(&self, request: RequestV1) -> Result<ResponseV1> {
        self.transport.request(&self.cancel, &request).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(RequestV1::ping()).await?;
        Ok(())
    }

    /// 当前会话的配置
    pub async fn get_config(&self) -> Result<serde_json::Value> {
        Ok(self
            .call(RequestV1::get_config())
            .await?
            .config
            .unwrap_or(serde_json::Value::Null))
    }

    /// 插件的可用版本
    pub async fn get_plugin(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .call(RequestV1::get_plugin_versions(name))
            .await?
            .versions
            .unwrap_or_default())
    }

    /// 以嵌套会话运行另一个插件，阻塞至其结束
    pub async fn run_plugin(&self, step: Step) -> Result<Report> {
        self.call(RequestV1::run_plugin(step))
            .await?
            .report
            .ok_or_else(|| Error::Protocol("RunPlugin response without report".to_string()))
    }

    pub async fn send_report(&self, report: Report) -> Result<()> {
        self.call(RequestV1::send_report(report)).await?;
        Ok(())
    }

    pub async fn download_file(&self, id: &str) -> Result<FileBlob> {
        self.call(RequestV1::download_file(id))
            .await?
            .file
            .ok_or_else(|| Error::Protocol("DownloadFile response without file".to_string()))
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.transport.close();
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
