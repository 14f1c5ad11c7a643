//! 作业执行：容器插件与脚本插件

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::runner::{RunEvent, RunSpec};
use super::worker::Agent;
use crate::config::{ENV_ENDPOINT, ENV_SESSION};
use crate::error::{Error, Result};
use crate::remote::RemoteServer;
use crate::transport::{Endpoint, Listener};
use crate::types::{Plugin, PluginKind, Session};

impl Agent {
    /// 执行一个会话：`Working` → 运行插件 → `Finished` / `Failed`
    pub async fn handle_scan(&self, mut session: Session, cancel: &CancellationToken) -> Result<()> {
        let plugin = match self
            .dispatcher
            .plugins_get(&session.step.plugin, session.step.version.as_deref())
            .await
        {
            Ok(plugin) => plugin,
            Err(e) => {
                self.mark_failed(&mut session).await;
                return Err(e);
            }
        };

        session.plugin = plugin.id.clone();
        session.start()?;
        self.dispatcher.session_update(&session).await?;
        tracing::info!(scan = %session.scan, session = %session.id, "▶️ running {} {}", plugin.name, plugin.version);

        let outcome = match plugin.kind {
            PluginKind::Container => self.run_container(&plugin, &session, cancel).await,
            PluginKind::Script => self.run_script(&plugin, &session, cancel).await,
        };

        match outcome {
            Ok(()) => {
                session.finish()?;
                self.dispatcher.session_update(&session).await?;
                tracing::info!(scan = %session.scan, session = %session.id, "✅ session finished");
                Ok(())
            }
            Err(e) => {
                self.mark_failed(&mut session).await;
                Err(e)
            }
        }
    }

    async fn mark_failed(&self, session: &mut Session) {
        if session.fail().is_err() {
            return;
        }
        if let Err(e) = self.dispatcher.session_update(session).await {
            tracing::warn!(session = %session.id, "failed to report failure: {}", e);
        }
    }

    async fn run_container(&self, plugin: &Plugin, session: &Session, cancel: &CancellationToken) -> Result<()> {
        let image = plugin
            .image
            .clone()
            .ok_or_else(|| Error::Plugin(format!("plugin {} has no image", plugin.name)))?;
        let spec = RunSpec {
            image,
            command: resolve_args(&plugin.command, &session.step.config),
            tty: false,
        };

        let mut events = self.runner.run_image(cancel, &spec).await?;
        let mut failure = None;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = events.recv() => event,
            };
            match event {
                Some(RunEvent::Log(line)) => tracing::debug!(session = %session.id, "{}", line),
                Some(RunEvent::Error(e)) => {
                    tracing::warn!(session = %session.id, "container error: {}", e);
                    failure = Some(e);
                }
                None => break,
            }
        }

        match failure {
            Some(e) => Err(Error::Plugin(e)),
            None => Ok(()),
        }
    }

    /// 启动脚本并在 Unix Socket 上托管 Remote Server，脚本退出后上报缓存的报告
    async fn run_script(&self, plugin: &Plugin, session: &Session, cancel: &CancellationToken) -> Result<()> {
        let script = plugin
            .script
            .clone()
            .ok_or_else(|| Error::Plugin(format!("plugin {} has no script", plugin.name)))?;

        let endpoint = Endpoint::Unix(self.config.run_dir().join(format!("{}.sock", session.id)));
        let listener = Listener::bind(&endpoint, &self.config.tls).await?;

        let mut child = Command::new(&script)
            .args(resolve_args(&plugin.command, &session.step.config))
            .env(ENV_ENDPOINT, endpoint.to_string())
            .env(ENV_SESSION, &session.id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Plugin(format!("failed to spawn {}: {}", script, e)))?;

        let conn = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            conn = listener.accept() => conn?,
            status = child.wait() => {
                return Err(Error::Plugin(format!("script exited before connecting: {:?}", status)));
            }
        };

        let server = Arc::new(
            RemoteServer::new(self.dispatcher.clone(), session.clone(), cancel).with_poll(self.config.poll),
        );
        let served = server.clone().run(conn).await;

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            status = child.wait() => status?,
        };
        served?;
        if !status.success() {
            return Err(Error::Plugin(format!("script exited with {}", status)));
        }

        if let Some(report) = server.take_report() {
            self.dispatcher.session_report_submit(session, &report).await?;
        }
        Ok(())
    }
}

/// 用会话配置替换参数中的 `{{key}}` 占位符；缺失的 key 原样保留
pub fn resolve_args(command: &[String], config: &serde_json::Value) -> Vec<String> {
    command.iter().map(|arg| resolve_arg(arg, config)).collect()
}

fn resolve_arg(arg: &str, config: &serde_json::Value) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + 2 + len].trim();
        out.push_str(&rest[..start]);
        match config.get(key) {
            Some(serde_json::Value::String(s)) => out.push_str(s),
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(&rest[start..start + len + 4]),
        }
        rest = &rest[start + len + 4..];
    }
    out.push_str(rest);
    out
}
