//! 容器执行
//!
//! [`ContainerRunner`] 是“运行镜像、流式返回日志”的协作者接口，
//! [`DockerRunner`] 通过 `tokio::process` 调用 docker CLI 实现。

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// 一次容器运行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub command: Vec<String>,
    pub tty: bool,
}

/// 运行过程中的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// 一行输出
    Log(String),
    /// 运行失败（非零退出、被取消等）
    Error(String),
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// 启动容器；事件流在容器结束后关闭
    async fn run_image(&self, cancel: &CancellationToken, spec: &RunSpec) -> Result<mpsc::Receiver<RunEvent>>;
}

/// docker CLI
pub struct DockerRunner {
    binary: String,
}

impl DockerRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `run --rm [-t] image cmd…`
    pub fn args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if spec.tty {
            args.push("-t".to_string());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn run_image(&self, cancel: &CancellationToken, spec: &RunSpec) -> Result<mpsc::Receiver<RunEvent>> {
        let mut child = Command::new(&self.binary)
            .args(Self::args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Plugin(format!("failed to spawn {}: {}", self.binary, e)))?;

        tracing::debug!(image = %spec.image, "🐳 container started");

        let (tx, rx) = mpsc::channel(100);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }

        let cancel = cancel.clone();
        let image = spec.image.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    tracing::debug!(image = %image, "container killed");
                    let _ = tx.send(RunEvent::Error("cancelled".to_string())).await;
                    return;
                }
            };
            match status {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let _ = tx
                        .send(RunEvent::Error(format!("container exited with {}", status)))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(RunEvent::Error(format!("wait failed: {}", e))).await;
                }
            }
        });

        Ok(rx)
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<RunEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(RunEvent::Log(line)).await.is_err() {
            break;
        }
    }
}
