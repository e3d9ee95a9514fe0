// src/server/listener.rs
// Low-level bind plus the optional TLS acceptor for the listening socket.
use crate::config::TlsConfig;
use crate::error::{ConfigError, EngineError};
use tokio::net::TcpListener;
use tokio_native_tls::{native_tls, TlsAcceptor};

pub async fn bind_tcp(addr: &str) -> Result<TcpListener, EngineError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| EngineError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// PEM certificate chain plus PKCS#8 key. The material is used as given.
pub async fn load_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ConfigError> {
    let cert = tokio::fs::read(&tls.cert_path).await.map_err(|e| {
        ConfigError::Tls(format!("reading {}: {}", tls.cert_path.display(), e))
    })?;
    let key = tokio::fs::read(&tls.key_path).await.map_err(|e| {
        ConfigError::Tls(format!("reading {}: {}", tls.key_path.display(), e))
    })?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    let acceptor =
        native_tls::TlsAcceptor::new(identity).map_err(|e| ConfigError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(acceptor))
}
