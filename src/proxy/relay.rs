// src/proxy/relay.rs
// HTTP-level relay: one inbound request, one outbound exchange.
use super::backend::{Backend, ConnectionGuard};
use super::upstream::{OutboundRequest, OutboundResponse};
use crate::context::ProxyContext;
use crate::error::{ProxyError, TransportError};
use crate::metrics::RequestRecord;
use crate::pool::{TargetEndpoint, TargetKind};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{Body, HeaderMap, Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";
const X_REQUEST_ID: &str = "x-request-id";

/// How one relayed exchange ended.
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// Backend answered 2xx/3xx.
    Success(StatusCode),
    /// Backend answered with a valid error status, relayed verbatim.
    UpstreamHttpError(StatusCode),
    Failed(ProxyError),
}

impl RelayOutcome {
    fn from_status(status: StatusCode) -> Self {
        if status.is_client_error() || status.is_server_error() {
            RelayOutcome::UpstreamHttpError(status)
        } else {
            RelayOutcome::Success(status)
        }
    }

    /// Any answer from the backend counts as a successful proxy operation.
    pub fn is_success(&self) -> bool {
        !matches!(self, RelayOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Success(_) => "success",
            RelayOutcome::UpstreamHttpError(_) => "upstream_http_error",
            RelayOutcome::Failed(err) => err.label(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayOutcome::Success(status) | RelayOutcome::UpstreamHttpError(status) => *status,
            RelayOutcome::Failed(err) => err.status(),
        }
    }
}

/// Accounts for one exchange exactly once, whichever way it ends.
/// Dropped without an outcome means the handler future was abandoned,
/// i.e. the client went away.
struct ExchangeRecord {
    ctx: Arc<ProxyContext>,
    request_id: Uuid,
    method: Method,
    path: String,
    peer: SocketAddr,
    started: Instant,
    bytes_in: u64,
    bytes_out: u64,
    outcome: Option<RelayOutcome>,
}

impl ExchangeRecord {
    fn begin(ctx: Arc<ProxyContext>, req: &Request<Body>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            request_id: Uuid::new_v4(),
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            peer,
            started: Instant::now(),
            bytes_in: 0,
            bytes_out: 0,
            outcome: None,
        }
    }

    fn finish(&mut self, outcome: RelayOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for ExchangeRecord {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or(RelayOutcome::Failed(ProxyError::ClientDisconnected));
        let elapsed = self.started.elapsed();

        self.ctx.stats.record(RequestRecord {
            success: outcome.is_success(),
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            elapsed,
        });
        self.ctx.metrics.record_request(
            "http",
            outcome.label(),
            self.bytes_in,
            self.bytes_out,
            elapsed,
        );

        info!(
            request_id = %self.request_id,
            peer = %self.peer,
            method = %self.method,
            path = %self.path,
            status = outcome.status().as_u16(),
            outcome = outcome.label(),
            elapsed_ms = elapsed.as_millis() as u64,
            "relayed"
        );
    }
}

#[derive(Clone)]
pub struct HttpRelay {
    ctx: Arc<ProxyContext>,
}

impl HttpRelay {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Relay one request. Every failure becomes a synthetic gateway
    /// response; nothing propagates to the connection task.
    pub async fn handle(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let mut record = ExchangeRecord::begin(self.ctx.clone(), &req, peer);

        match self.forward(req, peer, &mut record).await {
            Ok(response) => response,
            Err(err) => {
                warn!(request_id = %record.request_id, "Relay failed: {}", err);
                let response = Response::from(err.clone());
                record.finish(RelayOutcome::Failed(err));
                response
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Body>,
        peer: SocketAddr,
        record: &mut ExchangeRecord,
    ) -> Result<Response<Body>, ProxyError> {
        let backend = self
            .ctx
            .select_backend()
            .ok_or(ProxyError::NoHealthyTarget)?;
        let _guard = ConnectionGuard::acquire(backend.clone());

        let (parts, body) = req.into_parts();
        let body = read_body(&parts.headers, body, self.ctx.config.timeouts.request()).await?;
        record.bytes_in = body.len() as u64;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let via = if self.ctx.config.pool.enabled {
            Some(
                self.ctx
                    .pool
                    .checkout()
                    .await
                    .ok_or(ProxyError::NoHealthyTarget)?,
            )
        } else {
            None
        };

        // A backend-kind pool target replaces the configured backend as
        // the destination; proxy kinds carry the request to it.
        let (url, authority, proxy) = match &via {
            Some(target) if target.kind == TargetKind::Backend => (
                format!("http://{}{}", target.key, path_and_query),
                target.key.to_string(),
                None,
            ),
            Some(target) => (
                backend.request_url(&path_and_query),
                backend.authority().to_string(),
                Some(target),
            ),
            None => (
                backend.request_url(&path_and_query),
                backend.authority().to_string(),
                None,
            ),
        };

        let headers = forwarded_headers(
            &parts.headers,
            &authority,
            peer,
            self.ctx.is_tls(),
            record.request_id,
        );

        let outbound = OutboundRequest {
            method: parts.method,
            url,
            headers,
            body,
        };

        let started = Instant::now();
        let result = self.ctx.transport.send(outbound, proxy).await;
        self.record_target_outcome(via.as_ref(), &backend, &result, started)
            .await;

        let response = result.map_err(ProxyError::from)?;
        record.bytes_out = response.body.len() as u64;
        record.finish(RelayOutcome::from_status(response.status));
        Ok(into_client_response(response))
    }

    async fn record_target_outcome<T>(
        &self,
        via: Option<&TargetEndpoint>,
        backend: &Backend,
        result: &Result<T, TransportError>,
        started: Instant,
    ) {
        match (via, result) {
            (Some(target), Ok(_)) => {
                self.ctx
                    .pool
                    .record_success(&target.key, started.elapsed())
                    .await
            }
            (Some(target), Err(e)) => {
                warn!("Upstream target {} failed: {}", target.key, e);
                self.ctx.pool.record_failure(&target.key).await
            }
            (None, Err(e)) => warn!("Backend {} failed: {}", backend.id, e),
            (None, Ok(_)) => {}
        }
    }
}

/// Body per Content-Length; without one the request is treated as bodyless.
/// A client that stops sending before `limit` counts as gone.
async fn read_body(
    headers: &HeaderMap,
    body: Body,
    limit: Duration,
) -> Result<Bytes, ProxyError> {
    if !headers.contains_key(CONTENT_LENGTH) {
        return Ok(Bytes::new());
    }
    match timeout(limit, hyper::body::to_bytes(body)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(_)) | Err(_) => Err(ProxyError::ClientDisconnected),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn forwarded_headers(
    original: &HeaderMap,
    authority: &str,
    peer: SocketAddr,
    tls: bool,
    request_id: Uuid,
) -> HeaderMap {
    let mut headers = original.clone();
    strip_hop_by_hop(&mut headers);

    let client_ip = peer.ip().to_string();
    let forwarded_for = match original
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(chain) if !chain.is_empty() => format!("{}, {}", chain, client_ip),
        _ => client_ip.clone(),
    };

    if let Ok(value) = HeaderValue::from_str(authority) {
        headers.insert(HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if tls { "https" } else { "http" }),
    );
    if let Ok(value) = HeaderValue::from_str(&client_ip) {
        headers.insert(X_REAL_IP, value);
    }
    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }
    headers
}

fn into_client_response(upstream: OutboundResponse) -> Response<Body> {
    let mut headers = upstream.headers;
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}
