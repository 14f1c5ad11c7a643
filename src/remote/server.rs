//! Remote Plugin Server
//!
//! 由 Agent 为每个脚本插件会话托管，响应插件进程的类型化请求。

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::PollIntervals;
use crate::dispatcher::DispatcherApi;
use crate::error::{Error, Result};
use crate::protocol::{ConnectInfo, Method, RequestV1, ResponseV1};
use crate::transport::{Loop, RequestHandler, Transport};
use crate::types::{Report, Session, SessionStatus, Step};

/// 会话级 Remote Server
pub struct RemoteServer {
    dispatcher: Arc<dyn DispatcherApi>,
    session: Session,
    poll: PollIntervals,
    /// 插件通过 SendReport 提交的报告，等 Agent 取走后上报
    report: Mutex<Option<Report>>,
    /// 连接结束时取消，终止在途的 RunPlugin 轮询
    stop: CancellationToken,
}

impl RemoteServer {
    pub fn new(dispatcher: Arc<dyn DispatcherApi>, session: Session, cancel: &CancellationToken) -> Self {
        Self {
            dispatcher,
            session,
            poll: PollIntervals::default(),
            report: Mutex::new(None),
            stop: cancel.child_token(),
        }
    }

    pub fn with_poll(mut self, poll: PollIntervals) -> Self {
        self.poll = poll;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 取走缓存的报告
    pub fn take_report(&self) -> Option<Report> {
        self.report.lock().take()
    }

    /// 在一条连接上服务，直到对端断开或取消
    ///
    /// 先发送 Connect 握手，插件侧的 `wait_for_connection` 以此为准。
    /// 对端正常关闭视为成功。
    pub async fn run(self: Arc<Self>, conn: Loop) -> Result<()> {
        let transport = Arc::new(Transport::new(conn));
        let serving = {
            let transport = transport.clone();
            let cancel = self.stop.clone();
            let handler: Arc<dyn RequestHandler> = self.clone();
            tokio::spawn(async move { transport.serve(&cancel, handler).await })
        };

        let info = ConnectInfo {
            session: self.session.id.clone(),
            version: crate::VERSION_FULL.to_string(),
        };
        let handshake = transport
            .request::<_, ResponseV1>(&self.stop, &RequestV1::connect(info))
            .await;
        if let Err(e) = handshake {
            tracing::warn!(session = %self.session.id, "Connect handshake failed: {}", e);
            transport.close();
            let _ = serving.await;
            self.stop.cancel();
            return Err(e);
        }
        tracing::info!(session = %self.session.id, "🔗 plugin connected");

        let result = serving.await.map_err(|e| Error::Other(e.into()))?;
        self.stop.cancel();
        match result {
            Err(Error::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    /// 在当前会话下创建嵌套会话并阻塞等待其结束
    pub async fn run_plugin(&self, step: &Step, cancel: &CancellationToken) -> Result<Report> {
        let child = self.dispatcher.session_add_child(&self.session, step).await?;
        tracing::info!(session = %self.session.id, child = %child.id, "▶️ running nested plugin {}", step.plugin);

        let mut delay = self.poll.poll;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.dispatcher.session_get(&child.scan, &child.id).await {
                Ok(current) => match current.status {
                    SessionStatus::Finished => {
                        tracing::info!(child = %child.id, "✅ nested plugin finished");
                        // 容器插件不提交报告
                        return match self.dispatcher.session_report_get(&child.scan, &child.id).await {
                            Err(Error::NotFound(_)) => Ok(Report::default()),
                            other => other,
                        };
                    }
                    SessionStatus::Failed => {
                        return Err(Error::ChildFailed(child.id.clone()));
                    }
                    SessionStatus::Paused => delay = self.poll.paused,
                    _ => delay = self.poll.poll,
                },
                Err(e) => {
                    tracing::warn!(child = %child.id, "failed to poll nested session: {}", e);
                    delay = self.poll.error;
                }
            }
        }
    }

    async fn dispatch(&self, request: RequestV1) -> Result<ResponseV1> {
        match request.method {
            Method::Ping => Ok(ResponseV1::default()),
            Method::GetConfig => Ok(ResponseV1 {
                config: Some(self.session.step.config.clone()),
                ..Default::default()
            }),
            Method::GetPluginVersions => {
                let name = request
                    .get_plugin_versions
                    .ok_or_else(|| missing("get_plugin_versions"))?;
                let versions = self
                    .dispatcher
                    .plugins_list(&name)
                    .await?
                    .into_iter()
                    .map(|p| p.version)
                    .collect();
                Ok(ResponseV1 {
                    versions: Some(versions),
                    ..Default::default()
                })
            }
            Method::RunPlugin => {
                let step = request.run_plugin.ok_or_else(|| missing("run_plugin"))?;
                let report = self.run_plugin(&step, &self.stop).await?;
                Ok(ResponseV1 {
                    report: Some(report),
                    ..Default::default()
                })
            }
            Method::SendReport => {
                let report = request.send_report.ok_or_else(|| missing("send_report"))?;
                tracing::debug!(session = %self.session.id, "report cached ({} files)", report.files.len());
                *self.report.lock() = Some(report);
                Ok(ResponseV1::default())
            }
            Method::DownloadFile => {
                let id = request.download_file.ok_or_else(|| missing("download_file"))?;
                let file = self.dispatcher.files_download(&id).await?;
                Ok(ResponseV1 {
                    file: Some(file),
                    ..Default::default()
                })
            }
            Method::Connect => Err(Error::Protocol("Connect is sent by the server".to_string())),
            Method::Unknown(m) => Err(Error::Protocol(format!("unknown method {}", m))),
        }
    }
}

fn missing(field: &str) -> Error {
    Error::Protocol(format!("missing field {}", field))
}

#[async_trait]
impl RequestHandler for RemoteServer {
    async fn handle(&self, data: serde_json::Value) -> Result<serde_json::Value> {
        let request: RequestV1 =
            serde_json::from_value(data).map_err(|e| Error::Protocol(e.to_string()))?;
        let response = self.dispatch(request).await?;
        Ok(serde_json::to_value(response)?)
    }
}
