// src/proxy/upstream.rs
// Outbound HTTP, either direct or through one upstream target.
use crate::error::TransportError;
use crate::pool::{TargetEndpoint, TargetKey, TargetKind};
use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, HOST};
use hyper::{Body, HeaderMap, Method, StatusCode};
use std::time::Duration;
use tokio::time::timeout;
use tokio_socks::tcp::Socks4Stream;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

#[derive(Debug)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamTransport {
    direct: reqwest::Client,
    proxied: DashMap<TargetKey, reqwest::Client>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl UpstreamTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, TransportError> {
        let direct = client_builder(connect_timeout, request_timeout)
            .no_proxy()
            .build()?;

        Ok(Self {
            direct,
            proxied: DashMap::new(),
            connect_timeout,
            request_timeout,
        })
    }

    /// Send `request`, tunnelled through `via` when it is a proxy target.
    pub async fn send(
        &self,
        request: OutboundRequest,
        via: Option<&TargetEndpoint>,
    ) -> Result<OutboundResponse, TransportError> {
        match via {
            Some(target) if target.kind == TargetKind::Socks4 => {
                timeout(
                    self.request_timeout,
                    send_via_socks4(target, request, self.connect_timeout),
                )
                .await
                .map_err(|_| TransportError::Timeout)?
            }
            Some(target) if target.kind.is_proxy() => {
                let client = self.client_for(target)?;
                execute(&client, request).await
            }
            _ => execute(&self.direct, request).await,
        }
    }

    /// Drop the cached client for a target that left the pool.
    pub fn forget(&self, key: &TargetKey) {
        self.proxied.remove(key);
    }

    fn client_for(&self, target: &TargetEndpoint) -> Result<reqwest::Client, TransportError> {
        if let Some(client) = self.proxied.get(&target.key) {
            return Ok(client.clone());
        }

        let client = client_builder(self.connect_timeout, self.request_timeout)
            .proxy(proxy_for(target)?)
            .build()?;
        self.proxied.insert(target.key.clone(), client.clone());
        Ok(client)
    }
}

fn client_builder(connect_timeout: Duration, request_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        // Redirects are relayed, never followed.
        .redirect(reqwest::redirect::Policy::none())
}

fn proxy_for(target: &TargetEndpoint) -> Result<reqwest::Proxy, TransportError> {
    let proxy = match target.kind {
        TargetKind::Http | TargetKind::Https => {
            let proxy = reqwest::Proxy::all(format!("{}://{}", target.kind, target.key))?;
            match &target.credentials {
                Some(creds) => proxy.basic_auth(&creds.username, &creds.password),
                None => proxy,
            }
        }
        TargetKind::Socks5 => {
            let mut url = Url::parse(&format!("socks5h://{}", target.key))
                .map_err(|e| TransportError::Unsupported(e.to_string()))?;
            if let Some(creds) = &target.credentials {
                let _ = url.set_username(&creds.username);
                let _ = url.set_password(Some(&creds.password));
            }
            reqwest::Proxy::all(url.as_str())?
        }
        TargetKind::Socks4 | TargetKind::Backend => {
            return Err(TransportError::Unsupported(format!(
                "{} target {} is not an HTTP-client proxy",
                target.kind, target.key
            )))
        }
    };
    Ok(proxy)
}

async fn execute(
    client: &reqwest::Client,
    request: OutboundRequest,
) -> Result<OutboundResponse, TransportError> {
    let response = client
        .request(request.method, &request.url)
        .headers(request.headers)
        .body(request.body)
        .send()
        .await?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;

    Ok(OutboundResponse {
        status,
        headers,
        body,
    })
}

/// SOCKS4 tunnel carrying one plain-HTTP exchange.
async fn send_via_socks4(
    target: &TargetEndpoint,
    request: OutboundRequest,
    connect_timeout: Duration,
) -> Result<OutboundResponse, TransportError> {
    let url = Url::parse(&request.url).map_err(|e| TransportError::Unsupported(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(TransportError::Unsupported(format!(
            "socks4 target {} only carries http, not {}",
            target.key,
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::Unsupported(format!("no host in {}", url)))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    let proxy_addr = target.key.to_string();

    let connect = async {
        match &target.credentials {
            Some(creds) => {
                Socks4Stream::connect_with_userid(
                    proxy_addr.as_str(),
                    (host.as_str(), port),
                    &creds.username,
                )
                .await
            }
            None => Socks4Stream::connect(proxy_addr.as_str(), (host.as_str(), port)).await,
        }
    };

    let stream = timeout(connect_timeout, connect)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let (mut sender, connection) = hyper::client::conn::handshake(stream)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("socks4 connection closed: {}", e);
        }
    });

    let mut outbound = hyper::Request::new(Body::from(request.body));
    *outbound.method_mut() = request.method;
    *outbound.uri_mut() = url[url::Position::BeforePath..url::Position::AfterQuery]
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| TransportError::Unsupported(e.to_string()))?;
    *outbound.headers_mut() = request.headers;
    if !outbound.headers().contains_key(HOST) {
        let authority = HeaderValue::from_str(&format!("{}:{}", host, port))
            .map_err(|e| TransportError::Unsupported(e.to_string()))?;
        outbound.headers_mut().insert(HOST, authority);
    }

    let response = sender
        .send_request(outbound)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;

    let (parts, body) = response.into_parts();
    let body = hyper::body::to_bytes(body)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;

    Ok(OutboundResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}
