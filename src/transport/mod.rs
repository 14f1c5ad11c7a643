//! 传输模块 - 双工 socket 上的请求 / 响应 RPC
//!
//! Agent 链路与插件运行时链路共用：
//! - [`Loop`]：一条原始连接 + 读写任务
//! - [`Transport`]：ID 关联的请求 / 响应 + 服务端推送分发
//! - [`Endpoint`] / [`Listener`]：Unix Socket、TCP、WebSocket 及其 TLS 变体

mod conn;
mod endpoint;
mod rpc;
mod tls;

pub use conn::Loop;
pub use endpoint::{dial, Endpoint, Listener};
pub use rpc::{RequestHandler, Transport};
pub use tls::TlsConfig;
