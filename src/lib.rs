//! scanfleet - 分布式安全扫描编排核心
//!
//! Dispatcher 协调由有序插件执行（Session）组成的扫描（Scan），
//! 远端 Agent 拉取作业、运行插件（容器或脚本）并回报结果。
//!
//! # 核心功能
//!
//! - **传输**: 双工 socket 上的请求 / 响应 RPC（Unix Socket、TCP、WebSocket 及 TLS）
//! - **状态机**: Session / Scan 状态迁移与聚合
//! - **调度**: 每个 Scan 顺序执行、同时至多一个在途作业
//! - **Agent**: 注册 → 审批 → 轮询作业 → 执行
//! - **Remote Plugin 协议**: 运行中的插件以阻塞调用的方式执行嵌套插件
//!
//! # Feature Flags
//!
//! - `agent`: Agent 轮询状态机、容器执行、HTTP Dispatcher
//! - `websocket`: WebSocket 传输

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod protocol;
pub mod remote;
pub mod scan;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(feature = "agent")]
pub mod agent;

// Re-exports
pub use config::{ClientConfig, PollIntervals};
pub use dispatcher::{DispatcherApi, LocalDispatcher};
pub use error::{Error, Result};
pub use events::{Broadcaster, EventType, StatusEvent};
pub use protocol::{Command, ConnectInfo, Message, Method, RequestV1, ResponseV1};
pub use remote::{RemoteClient, RemoteServer};
pub use scan::ScanChange;
pub use scheduler::{MemoryScheduler, Scheduler};
pub use store::{MemoryStore, ScanStore, StoreError};
pub use transport::{dial, Endpoint, Listener, Loop, RequestHandler, TlsConfig, Transport};
pub use types::*;

#[cfg(feature = "agent")]
pub use agent::{cleanup_stale_agent, is_agent_running, Agent, DockerRunner};
#[cfg(feature = "agent")]
pub use config::AgentConfig;
#[cfg(feature = "agent")]
pub use dispatcher::HttpDispatcher;

/// 编译时间戳
///
/// 格式：Unix 时间戳（秒）
pub const BUILD_TIMESTAMP: u64 = {
    // const 中不能直接用 parse()，需要手动解析
    const BYTES: &[u8] = env!("BUILD_TIMESTAMP").as_bytes();
    const fn parse_u64(bytes: &[u8]) -> u64 {
        let mut result = 0u64;
        let mut i = 0;
        while i < bytes.len() {
            result = result * 10 + (bytes[i] - b'0') as u64;
            i += 1;
        }
        result
    }
    parse_u64(BYTES)
};

/// 完整版本号（语义版本 + 编译时间戳），在 Connect 握手中发送
///
/// 格式：`{CARGO_PKG_VERSION}-{BUILD_TIMESTAMP}`
pub const VERSION_FULL: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"));
