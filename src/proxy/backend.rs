// src/proxy/backend.rs
use crate::config::BackendConfig;
use crate::error::ConfigError;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// A fixed backend from configuration.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,
    host: String,
    port: u16,

    // Runtime state
    active_connections: AtomicUsize,
}

impl Backend {
    pub fn new(url: Url) -> Result<Self, ConfigError> {
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBackend {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidBackend {
                url: url.to_string(),
                reason: "missing port".to_string(),
            })?;

        Ok(Self {
            id: format!("{}:{}", host, port),
            url,
            host,
            port,
            active_connections: AtomicUsize::new(0),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for `TcpStream::connect` and the `Host` header.
    pub fn authority(&self) -> &str {
        &self.id
    }

    /// Absolute URL for a relayed path-and-query.
    pub fn request_url(&self, path_and_query: &str) -> String {
        let scheme = match self.url.scheme() {
            "https" => "https",
            _ => "http",
        };
        format!("{}://{}{}", scheme, self.id, path_and_query)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_connections(&self) {
        // Saturate at zero rather than wrap.
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// In-flight slot on a backend. Released exactly once, either explicitly
/// or when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
    released: AtomicBool,
}

impl ConnectionGuard {
    pub fn acquire(backend: Arc<Backend>) -> Self {
        backend.increment_connections();
        Self {
            backend,
            released: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.backend.decrement_connections();
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
    pub active_connections: usize,
}

/// The configured backends in order, plus reachability written by the
/// health checker and read by selection.
#[derive(Debug)]
pub struct BackendSet {
    backends: Vec<Arc<Backend>>,
    health: DashMap<String, bool>,
}

impl BackendSet {
    pub fn new(configs: &[BackendConfig]) -> Result<Self, ConfigError> {
        let backends = configs
            .iter()
            .map(|config| Backend::new(config.url.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let health = DashMap::new();
        for backend in &backends {
            health.insert(backend.url.to_string(), true);
        }

        Ok(Self { backends, health })
    }

    pub fn all(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Healthy backends in configured order.
    pub fn healthy(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| self.is_healthy(b))
            .cloned()
            .collect()
    }

    pub fn is_healthy(&self, backend: &Backend) -> bool {
        self.health
            .get(backend.url.as_str())
            .map(|entry| *entry)
            .unwrap_or(true)
    }

    pub(crate) fn set_health(&self, backend: &Backend, healthy: bool) -> bool {
        let previous = self.health.insert(backend.url.to_string(), healthy);
        previous != Some(healthy)
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus {
                url: b.url.to_string(),
                healthy: self.is_healthy(b),
                active_connections: b.active_connections(),
            })
            .collect()
    }
}
