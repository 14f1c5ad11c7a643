//! TLS 配置
//!
//! 客户端根证书来自 PEM CA 文件，未配置时使用内置的 Web PKI 根证书。

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, Result};

/// TLS 配置
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA 证书（PEM）
    pub ca_file: Option<PathBuf>,
    /// 服务端证书链（PEM，仅监听时需要）
    pub cert_file: Option<PathBuf>,
    /// 服务端私钥（PEM，仅监听时需要）
    pub key_file: Option<PathBuf>,
}

impl TlsConfig {
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert.into());
        self.key_file = Some(key.into());
        self
    }

    /// 客户端配置
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        match &self.ca_file {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots.add(cert)?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Arc::new(config))
    }

    /// 服务端配置
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let (cert_path, key_path) = match (&self.cert_file, &self.key_file) {
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(Error::Config(
                    "TLS 监听需要 cert_file 和 key_file".to_string(),
                ))
            }
        };

        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

        Ok(Arc::new(config))
    }
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_config_uses_bundled_roots() {
        assert!(TlsConfig::default().client_config().is_ok());
    }

    #[test]
    fn test_server_config_requires_identity() {
        let err = TlsConfig::default().server_config().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig::default().with_ca_file("/nonexistent/ca.pem");
        assert!(matches!(config.client_config(), Err(Error::Io(_))));
    }
}
