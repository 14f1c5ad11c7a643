//! 错误类型定义

use thiserror::Error;

use crate::types::SessionStatus;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 协议错误（消息格式错误、未知命令或方法），只影响当前请求
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 传输错误（socket 读写失败），连接随之终止
    #[error("传输错误: {0}")]
    Transport(String),

    /// 对端正常关闭连接
    #[error("连接已关闭")]
    ConnectionClosed,

    /// 调用方取消
    #[error("操作已取消")]
    Cancelled,

    /// 对端以 Error 消息回复
    #[error("远端错误: {0}")]
    Remote(String),

    /// 资源不存在
    #[error("未找到: {0}")]
    NotFound(String),

    /// 资源冲突（例如 Agent 已注册）
    #[error("冲突: {0}")]
    Conflict(String),

    /// Dispatcher 返回的其他非成功状态
    #[error("Dispatcher 错误 ({status}): {message}")]
    Api { status: u16, message: String },

    /// 非法状态迁移
    #[error("非法状态迁移: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// 嵌套会话执行失败
    #[error("子会话失败: {0}")]
    ChildFailed(String),

    /// Agent 被封禁
    #[error("Agent 已被封禁")]
    AgentBlocked,

    /// Dispatcher 返回未知的 Agent 状态
    #[error("未知的 Agent 状态: {0}")]
    UnknownAgentStatus(String),

    /// 插件执行失败
    #[error("插件执行失败: {0}")]
    Plugin(String),

    /// TLS 配置错误
    #[error("TLS 错误: {0}")]
    Tls(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// HTTP 错误
    #[cfg(feature = "agent")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否需要终止 Agent 进程
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AgentBlocked | Error::UnknownAgentStatus(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
