// src/error.rs
use hyper::{Body, Response, StatusCode};

/// Configuration the engine refuses to start with.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No backend servers configured")]
    NoBackends,

    #[error("Invalid backend {url}: {reason}")]
    InvalidBackend { url: String, reason: String },

    #[error("Invalid listen address {0}")]
    InvalidListenAddress(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-request failures of the HTTP relay.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy target available")]
    NoHealthyTarget,

    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("Upstream connect error: {0}")]
    UpstreamConnect(String),

    #[error("Client disconnected")]
    ClientDisconnected,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoHealthyTarget => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            // Never reaches the client; only used for accounting.
            ProxyError::ClientDisconnected => StatusCode::BAD_REQUEST,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProxyError::NoHealthyTarget => "no_healthy_target",
            ProxyError::UpstreamTimeout => "upstream_timeout",
            ProxyError::UpstreamConnect(_) => "upstream_connect_error",
            ProxyError::ClientDisconnected => "client_disconnected",
        }
    }
}

impl From<TransportError> for ProxyError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ProxyError::UpstreamTimeout,
            other => ProxyError::UpstreamConnect(other.to_string()),
        }
    }
}

// Synthetic gateway response carrying a short reason
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let message = match &err {
            ProxyError::NoHealthyTarget => "Service unavailable: no healthy target",
            ProxyError::UpstreamTimeout => "Gateway timeout",
            ProxyError::UpstreamConnect(_) => "Bad gateway",
            ProxyError::ClientDisconnected => "Client disconnected",
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = err.status();
        response
    }
}

/// Connect, read or write failure towards a backend or upstream target.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("unsupported route: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::Unsupported(err.to_string())
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::AddrNotAvailable => TransportError::Connect(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Why a validation probe failed. Always contained by the pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("probe timed out")]
    Timeout,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Rejected administrative input. Nothing is mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminInputError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("unknown target kind: {0}")]
    UnknownKind(String),

    #[error("malformed target line: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Admin server error: {0}")]
    Admin(#[from] hyper::Error),
}
