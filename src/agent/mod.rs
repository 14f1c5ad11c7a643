//! Agent 模块 - 远程 worker 进程
//!
//! - 注册、等待审批、轮询作业
//! - 容器插件交给 [`ContainerRunner`]
//! - 脚本插件托管 Remote Plugin Server

mod job;
mod pidfile;
mod runner;
mod worker;

pub use job::resolve_args;
pub use pidfile::{cleanup_stale_agent, is_agent_running};
pub use runner::{ContainerRunner, DockerRunner, RunEvent, RunSpec};
pub use worker::Agent;
