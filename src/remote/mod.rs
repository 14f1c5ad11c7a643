//! Remote Plugin 执行协议
//!
//! 同一条 Transport 上的两个角色：
//! - [`RemoteServer`]：Agent 为每个会话托管
//! - [`RemoteClient`]：链接进插件进程，把 GetConfig / RunPlugin 等暴露为阻塞调用

mod client;
mod server;

pub use client::RemoteClient;
pub use server::RemoteServer;
