//! scanfleet-agent - 扫描 Agent
//!
//! 负责：
//! - 向 Dispatcher 注册并等待审批
//! - 轮询作业
//! - 运行容器插件 / 托管脚本插件

use scanfleet::agent::{cleanup_stale_agent, is_agent_running, Agent};
use scanfleet::config::AgentConfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("scanfleet=debug".parse()?))
        .init();

    tracing::info!("🚀 scanfleet-agent v{}", scanfleet::VERSION_FULL);

    let config = AgentConfig::from_env()?;

    // 检查是否已有 Agent 运行
    if is_agent_running(&config) {
        tracing::error!("❌ Agent is already running, exiting");
        std::process::exit(1);
    }

    if let Err(e) = cleanup_stale_agent(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("收到中断信号，准备退出...");
                cancel.cancel();
            }
        });
    }

    let mut agent = Agent::from_config(config)?;
    agent.run(&cancel).await?;

    tracing::info!("👋 scanfleet-agent exiting");
    Ok(())
}
