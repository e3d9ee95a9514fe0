// src/pool/target.rs
use crate::error::AdminInputError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Most recent response-time samples kept per target.
pub const RESPONSE_WINDOW: usize = 100;

/// Deactivate once failures exceed this...
pub const DEACTIVATION_FAILURES: u64 = 5;
/// ...while the success rate is below this.
pub const DEACTIVATION_SUCCESS_RATE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Http,
    Https,
    Socks4,
    Socks5,
    /// A backend server reached directly instead of an upstream proxy.
    Backend,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Http => "http",
            TargetKind::Https => "https",
            TargetKind::Socks4 => "socks4",
            TargetKind::Socks5 => "socks5",
            TargetKind::Backend => "backend",
        }
    }

    pub fn is_proxy(&self) -> bool {
        !matches!(self, TargetKind::Backend)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = AdminInputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TargetKind::Http),
            "https" => Ok(TargetKind::Https),
            "socks4" => Ok(TargetKind::Socks4),
            "socks5" => Ok(TargetKind::Socks5),
            "backend" | "backend-url" => Ok(TargetKind::Backend),
            other => Err(AdminInputError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity of a target inside the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub host: String,
    pub port: u16,
}

impl TargetKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// IPv6 hosts are bracketed so the port stays unambiguous.
impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Everything needed to route traffic through a target, detached from
/// its health state.
#[derive(Debug, Clone)]
pub struct TargetEndpoint {
    pub key: TargetKey,
    pub kind: TargetKind,
    pub credentials: Option<Credentials>,
}

/// Bounded ring of response-time samples, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct ResponseWindow {
    samples: VecDeque<Duration>,
}

impl ResponseWindow {
    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == RESPONSE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// One upstream proxy or backend endpoint with its rolling health record.
#[derive(Debug, Clone)]
pub struct Target {
    key: TargetKey,
    kind: TargetKind,
    credentials: Option<Credentials>,
    active: bool,
    success_count: u64,
    failure_count: u64,
    last_used: Option<DateTime<Utc>>,
    last_validated: Option<DateTime<Utc>>,
    response_times: ResponseWindow,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, kind: TargetKind) -> Self {
        Self {
            key: TargetKey::new(host, port),
            kind,
            credentials: None,
            active: true,
            success_count: 0,
            failure_count: 0,
            last_used: None,
            last_validated: None,
            response_times: ResponseWindow::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Parse `host:port` or `host:port:type`; the kind defaults to http.
    /// IPv6 hosts are written as `[addr]:port[:type]`.
    pub fn parse_line(line: &str) -> Result<Self, AdminInputError> {
        let line = line.trim();
        let malformed = || AdminInputError::Malformed(line.to_string());

        let (host, rest) = match line.strip_prefix('[') {
            Some(bracketed) => {
                let (host, rest) = bracketed.split_once(']').ok_or_else(malformed)?;
                (host, rest.strip_prefix(':').ok_or_else(malformed)?)
            }
            None => line.split_once(':').ok_or_else(malformed)?,
        };

        let host = host.trim();
        if host.is_empty() {
            return Err(AdminInputError::EmptyHost);
        }

        let fields: Vec<&str> = rest.split(':').collect();
        if fields.len() > 2 {
            return Err(malformed());
        }

        let port = parse_port(fields[0])?;
        let kind = match fields.get(1) {
            Some(kind) => kind.parse()?,
            None => TargetKind::Http,
        };

        Ok(Target::new(host, port, kind))
    }

    /// The persisted three-field form.
    pub fn to_line(&self) -> String {
        format!("{}:{}", self.key, self.kind)
    }

    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.last_used
    }

    pub fn response_times(&self) -> &ResponseWindow {
        &self.response_times
    }

    pub fn endpoint(&self) -> TargetEndpoint {
        TargetEndpoint {
            key: self.key.clone(),
            kind: self.kind,
            credentials: self.credentials.clone(),
        }
    }

    /// successes / (successes + failures); 0 before any outcome.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    fn should_deactivate(&self) -> bool {
        self.failure_count > DEACTIVATION_FAILURES
            && self.success_rate() < DEACTIVATION_SUCCESS_RATE
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Some(Utc::now());
    }

    pub(crate) fn mark_validated(&mut self) {
        self.last_validated = Some(Utc::now());
    }

    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.success_count += 1;
        self.response_times.push(elapsed);
    }

    /// Returns true when this failure deactivated the target.
    pub(crate) fn record_failure(&mut self) -> bool {
        self.failure_count += 1;
        if self.active && self.should_deactivate() {
            self.active = false;
            return true;
        }
        false
    }

    /// Returns true when the target came back into the active set.
    pub(crate) fn try_reactivate(&mut self) -> bool {
        if !self.active && !self.should_deactivate() {
            self.active = true;
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            host: self.key.host.clone(),
            port: self.key.port,
            kind: self.kind,
            active: self.active,
            success_count: self.success_count,
            failure_count: self.failure_count,
            success_rate: self.success_rate() * 100.0,
            avg_response_ms: self
                .response_times
                .average()
                .map(|avg| avg.as_secs_f64() * 1000.0),
            last_used: self.last_used,
            last_validated: self.last_validated,
        }
    }
}

pub(crate) fn parse_port(raw: &str) -> Result<u16, AdminInputError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(AdminInputError::InvalidPort(raw.to_string())),
        Ok(port) => Ok(port),
    }
}

/// Point-in-time view handed to admin callers.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub host: String,
    pub port: u16,
    pub kind: TargetKind,
    pub active: bool,
    pub success_count: u64,
    pub failure_count: u64,
    /// Percent, 0..=100.
    pub success_rate: f64,
    pub avg_response_ms: Option<f64>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_validated: Option<DateTime<Utc>>,
}
