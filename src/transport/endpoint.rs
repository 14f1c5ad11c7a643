//! 传输端点
//!
//! 同一套 Loop / Transport 可以承载在以下任一连接上：
//! - `unix:///path/to/sock`（别名 `ipc://`）
//! - `tcp://host:port`
//! - `tls://host:port`
//! - `ws://host:port/path`、`wss://host:port/path`（需要 `websocket` feature）

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::str::FromStr;

use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::conn::Loop;
use super::tls::TlsConfig;
use crate::error::{Error, Result};

/// 传输端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
    Tls(String),
    Ws(String),
    Wss(String),
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("endpoint 缺少 scheme: {}", s)))?;
        if rest.is_empty() {
            return Err(Error::Config(format!("endpoint 缺少地址: {}", s)));
        }
        match scheme {
            "unix" | "ipc" => Ok(Endpoint::Unix(PathBuf::from(rest))),
            "tcp" => Ok(Endpoint::Tcp(rest.to_string())),
            "tls" => Ok(Endpoint::Tls(rest.to_string())),
            "ws" => Ok(Endpoint::Ws(s.to_string())),
            "wss" => Ok(Endpoint::Wss(s.to_string())),
            other => Err(Error::Config(format!("不支持的 endpoint scheme: {}", other))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Tls(addr) => write!(f, "tls://{}", addr),
            Endpoint::Ws(url) | Endpoint::Wss(url) => write!(f, "{}", url),
        }
    }
}

/// `host:port` 中的 host，用于 TLS SNI
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// `ws://host:port/path` 中的 `host:port`
fn authority_of(url: &str) -> Result<&str> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::Config(format!("invalid url: {}", url)))?;
    Ok(rest.split('/').next().unwrap_or(rest))
}

/// 主动连接
pub async fn dial(endpoint: &Endpoint, tls: &TlsConfig) -> Result<Loop> {
    tracing::debug!("🔌 dialing {}", endpoint);
    match endpoint {
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Loop::from_stream(stream))
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Loop::from_stream(stream))
        }
        Endpoint::Tls(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let domain = ServerName::try_from(host_of(addr).to_string())
                .map_err(|e| Error::Tls(format!("invalid server name {}: {}", addr, e)))?;
            let connector = TlsConnector::from(tls.client_config()?);
            let stream = connector.connect(domain, stream).await?;
            Ok(Loop::from_stream(stream))
        }
        #[cfg(feature = "websocket")]
        Endpoint::Ws(url) => {
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| Error::Transport(format!("websocket connect failed: {}", e)))?;
            Ok(Loop::from_websocket(ws))
        }
        #[cfg(feature = "websocket")]
        Endpoint::Wss(url) => {
            let connector = tokio_tungstenite::Connector::Rustls(tls.client_config()?);
            let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(
                url.as_str(),
                None,
                false,
                Some(connector),
            )
            .await
            .map_err(|e| Error::Transport(format!("websocket connect failed: {}", e)))?;
            Ok(Loop::from_websocket(ws))
        }
        #[cfg(not(feature = "websocket"))]
        Endpoint::Ws(_) | Endpoint::Wss(_) => Err(Error::Config(
            "WebSocket 传输需要启用 websocket feature".to_string(),
        )),
    }
}

enum ListenerKind {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener, Option<TlsAcceptor>),
    #[cfg(feature = "websocket")]
    Ws(TcpListener, Option<TlsAcceptor>, String),
}

/// 被动监听
pub struct Listener {
    kind: ListenerKind,
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint, tls: &TlsConfig) -> Result<Self> {
        let kind = match endpoint {
            Endpoint::Unix(path) => {
                // 清理旧的 socket 文件
                if path.exists() {
                    fs::remove_file(path)?;
                }
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                let listener = UnixListener::bind(path)?;
                fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
                ListenerKind::Unix(listener, path.clone())
            }
            Endpoint::Tcp(addr) => ListenerKind::Tcp(TcpListener::bind(addr).await?, None),
            Endpoint::Tls(addr) => ListenerKind::Tcp(
                TcpListener::bind(addr).await?,
                Some(TlsAcceptor::from(tls.server_config()?)),
            ),
            #[cfg(feature = "websocket")]
            Endpoint::Ws(url) => {
                ListenerKind::Ws(TcpListener::bind(authority_of(url)?).await?, None, path_of(url))
            }
            #[cfg(feature = "websocket")]
            Endpoint::Wss(url) => ListenerKind::Ws(
                TcpListener::bind(authority_of(url)?).await?,
                Some(TlsAcceptor::from(tls.server_config()?)),
                path_of(url),
            ),
            #[cfg(not(feature = "websocket"))]
            Endpoint::Ws(_) | Endpoint::Wss(_) => {
                return Err(Error::Config(
                    "WebSocket 传输需要启用 websocket feature".to_string(),
                ))
            }
        };
        let listener = Self { kind };
        tracing::info!("🚀 listening on {}", listener.local_endpoint()?);
        Ok(listener)
    }

    /// 实际绑定的端点（绑定端口 0 时可取得真实端口）
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match &self.kind {
            ListenerKind::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
            ListenerKind::Tcp(listener, None) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            ListenerKind::Tcp(listener, Some(_)) => Ok(Endpoint::Tls(listener.local_addr()?.to_string())),
            #[cfg(feature = "websocket")]
            ListenerKind::Ws(listener, tls, path) => {
                let scheme = if tls.is_some() { "wss" } else { "ws" };
                let url = format!("{}://{}{}", scheme, listener.local_addr()?, path);
                Ok(if tls.is_some() { Endpoint::Wss(url) } else { Endpoint::Ws(url) })
            }
        }
    }

    /// 接受一条连接
    pub async fn accept(&self) -> Result<Loop> {
        match &self.kind {
            ListenerKind::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Loop::from_stream(stream))
            }
            ListenerKind::Tcp(listener, acceptor) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::debug!("📥 accepted {}", peer);
                match acceptor {
                    Some(acceptor) => Ok(Loop::from_stream(acceptor.accept(stream).await?)),
                    None => Ok(Loop::from_stream(stream)),
                }
            }
            #[cfg(feature = "websocket")]
            ListenerKind::Ws(listener, acceptor, _) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::debug!("📥 accepted websocket {}", peer);
                let upgrade_err = |e: tokio_tungstenite::tungstenite::Error| {
                    Error::Transport(format!("websocket handshake failed: {}", e))
                };
                match acceptor {
                    Some(acceptor) => {
                        let tls = acceptor.accept(stream).await?;
                        let ws = tokio_tungstenite::accept_async(tls).await.map_err(upgrade_err)?;
                        Ok(Loop::from_websocket(ws))
                    }
                    None => {
                        let ws = tokio_tungstenite::accept_async(stream).await.map_err(upgrade_err)?;
                        Ok(Loop::from_websocket(ws))
                    }
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenerKind::Unix(_, path) = &self.kind {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(feature = "websocket")]
fn path_of(url: &str) -> String {
    authority_of(url)
        .ok()
        .and_then(|authority| url.split_once(authority).map(|(_, path)| path.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            "unix:///tmp/agent.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/agent.sock"))
        );
        assert_eq!(
            "ipc:///tmp/a.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/a.sock"))
        );
        assert_eq!(
            "tcp://127.0.0.1:9000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:9000".to_string())
        );
        assert_eq!(
            "wss://dispatcher.example.org/agent".parse::<Endpoint>().unwrap(),
            Endpoint::Wss("wss://dispatcher.example.org/agent".to_string())
        );
        assert!("127.0.0.1:9000".parse::<Endpoint>().is_err());
        assert!("http://x".parse::<Endpoint>().is_err());
        assert!("tcp://".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for raw in ["unix:///tmp/x.sock", "tcp://127.0.0.1:1", "tls://example.org:443", "ws://127.0.0.1:80/rpc"] {
            assert_eq!(raw.parse::<Endpoint>().unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_host_and_authority() {
        assert_eq!(host_of("example.org:443"), "example.org");
        assert_eq!(host_of("[::1]:443"), "::1");
        assert_eq!(authority_of("ws://127.0.0.1:80/rpc").unwrap(), "127.0.0.1:80");
    }
}
