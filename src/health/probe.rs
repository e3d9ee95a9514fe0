// src/health/probe.rs
use crate::error::{TransportError, ValidationError};
use crate::pool::{TargetEndpoint, TargetKind};
use crate::proxy::{OutboundRequest, UpstreamTransport};
use async_trait::async_trait;
use hyper::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use url::Url;

/// End-to-end reachability check of one pool target.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Elapsed time of a successful probe.
    async fn probe(&self, target: &TargetEndpoint) -> Result<Duration, ValidationError>;
}

/// Fetches a fixed endpoint through the target and expects HTTP 200.
/// Backend-kind targets are fetched directly instead.
pub struct ValidationProbe {
    transport: Arc<UpstreamTransport>,
    url: Url,
    timeout: Duration,
}

impl ValidationProbe {
    pub fn new(transport: Arc<UpstreamTransport>, url: Url, timeout: Duration) -> Self {
        Self {
            transport,
            url,
            timeout,
        }
    }

    fn request_for(&self, target: &TargetEndpoint) -> (OutboundRequest, Option<TargetEndpoint>) {
        match target.kind {
            TargetKind::Backend => (
                OutboundRequest::get(format!("http://{}/", target.key)),
                None,
            ),
            _ => (OutboundRequest::get(self.url.as_str()), Some(target.clone())),
        }
    }
}

#[async_trait]
impl Probe for ValidationProbe {
    async fn probe(&self, target: &TargetEndpoint) -> Result<Duration, ValidationError> {
        let (request, via) = self.request_for(target);
        let start = Instant::now();

        let response = timeout(self.timeout, self.transport.send(request, via.as_ref()))
            .await
            .map_err(|_| ValidationError::Timeout)?
            .map_err(|e| match e {
                TransportError::Timeout => ValidationError::Timeout,
                other => ValidationError::Transport(other),
            })?;

        if response.status != StatusCode::OK {
            return Err(ValidationError::Status(response.status.as_u16()));
        }
        Ok(start.elapsed())
    }
}
