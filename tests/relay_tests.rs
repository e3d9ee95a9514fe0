// tests/relay_tests.rs
use hyper::{Body, Request, StatusCode};
use mockito::Matcher;
use proxy_relay::config::{
    BackendConfig, Config, PoolConfig, RelayMode, ServerConfig, TimeoutConfig,
};
use proxy_relay::pool::{Target, TargetKey, TargetKind};
use proxy_relay::proxy::HttpRelay;
use proxy_relay::ProxyContext;
use std::net::SocketAddr;
use std::sync::Arc;
use url::Url;

fn peer() -> SocketAddr {
    "192.0.2.10:51000".parse().unwrap()
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn http_context(backend: &str, pool_enabled: bool) -> Arc<ProxyContext> {
    let config = Config {
        server: ServerConfig {
            mode: RelayMode::Http,
            ..ServerConfig::default()
        },
        backends: vec![BackendConfig {
            url: Url::parse(backend).unwrap(),
        }],
        pool: PoolConfig {
            enabled: pool_enabled,
            ..PoolConfig::default()
        },
        timeouts: TimeoutConfig {
            connect_secs: 2,
            request_secs: 5,
        },
        ..Config::default()
    };
    Arc::new(ProxyContext::new(config).unwrap())
}

async fn body_text(response: hyper::Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn backend_error_status_is_relayed_and_counted_as_success() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend
        .mock("GET", "/missing")
        .with_status(404)
        .with_body("nothing here")
        .create_async()
        .await;

    let ctx = http_context(&backend.url(), false);
    let relay = HttpRelay::new(ctx.clone());

    let request = Request::get("/missing").body(Body::empty()).unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_text(response).await, "nothing here");
    mock.assert_async().await;

    let stats = ctx.stats.snapshot();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failure, 0);
    assert_eq!(stats.bytes_out, "nothing here".len() as u64);
}

#[tokio::test]
async fn no_healthy_backend_yields_service_unavailable() {
    let ctx = http_context(&format!("http://127.0.0.1:{}", closed_port()), false);
    ctx.health.clone().check_all().await;

    let relay = HttpRelay::new(ctx.clone());
    let request = Request::get("/").body(Body::empty()).unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let stats = ctx.stats.snapshot();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 0);
}

#[tokio::test]
async fn refused_backend_yields_bad_gateway() {
    // Still marked healthy: no sweep has run yet.
    let ctx = http_context(&format!("http://127.0.0.1:{}", closed_port()), false);
    let relay = HttpRelay::new(ctx.clone());

    let request = Request::get("/").body(Body::empty()).unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(ctx.stats.snapshot().failure, 1);
}

#[tokio::test]
async fn hop_by_hop_headers_are_replaced_with_forwarding_headers() {
    let mut backend = mockito::Server::new_async().await;
    let authority = backend.host_with_port();
    let mock = backend
        .mock("POST", "/submit")
        .match_header("proxy-authorization", Matcher::Missing)
        .match_header("upgrade", Matcher::Missing)
        .match_header("host", authority.as_str())
        .match_header("x-forwarded-for", "198.51.100.1, 192.0.2.10")
        .match_header("x-real-ip", "192.0.2.10")
        .match_header("x-forwarded-proto", "http")
        .match_header("x-custom", "kept")
        .match_body("payload")
        .with_status(201)
        .create_async()
        .await;

    let ctx = http_context(&backend.url(), false);
    let relay = HttpRelay::new(ctx.clone());

    let request = Request::post("/submit")
        .header("host", "public.example")
        .header("proxy-authorization", "Basic c2VjcmV0")
        .header("upgrade", "websocket")
        .header("x-forwarded-for", "198.51.100.1")
        .header("x-custom", "kept")
        .header("content-length", "7")
        .body(Body::from("payload"))
        .unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    mock.assert_async().await;
    assert_eq!(ctx.stats.snapshot().bytes_in, 7);
}

#[tokio::test]
async fn enabled_pool_without_targets_refuses_to_go_direct() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend
        .mock("GET", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let ctx = http_context(&backend.url(), true);
    let relay = HttpRelay::new(ctx.clone());

    let request = Request::get("/").body(Body::empty()).unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    mock.assert_async().await;
}

#[tokio::test]
async fn requests_travel_through_the_current_proxy_target() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("GET", Matcher::Any)
        .with_status(200)
        .with_body("via proxy")
        .create_async()
        .await;

    // The backend itself is never contacted directly.
    let ctx = http_context("http://backend.invalid:8080", true);
    let proxy_port = Url::parse(&upstream.url()).unwrap().port().unwrap();
    assert!(
        ctx.pool
            .add(Target::new("127.0.0.1", proxy_port, TargetKind::Http))
            .await
    );

    let relay = HttpRelay::new(ctx.clone());
    let request = Request::get("/data").body(Body::empty()).unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "via proxy");
    mock.assert_async().await;

    let targets = ctx.pool.list().await;
    assert_eq!(targets[0].success_count, 1);
    assert!(targets[0].last_used.is_some());
}

#[tokio::test]
async fn backend_kind_target_becomes_the_destination() {
    let mut alternate = mockito::Server::new_async().await;
    let mock = alternate
        .mock("GET", "/path")
        .match_query(Matcher::UrlEncoded("q".into(), "1".into()))
        .with_status(200)
        .with_body("alternate")
        .create_async()
        .await;

    let ctx = http_context("http://backend.invalid:8080", true);
    let port = Url::parse(&alternate.url()).unwrap().port().unwrap();
    ctx.pool
        .add(Target::new("127.0.0.1", port, TargetKind::Backend))
        .await;

    let relay = HttpRelay::new(ctx.clone());
    let request = Request::get("/path?q=1").body(Body::empty()).unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(body_text(response).await, "alternate");
    mock.assert_async().await;
}

#[tokio::test]
async fn failing_proxy_target_records_a_failure() {
    let ctx = http_context("http://backend.invalid:8080", true);
    let dead = closed_port();
    ctx.pool
        .add(Target::new("127.0.0.1", dead, TargetKind::Http))
        .await;

    let relay = HttpRelay::new(ctx.clone());
    let request = Request::get("/").body(Body::empty()).unwrap();
    let response = relay.handle(request, peer()).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let key = TargetKey::new("127.0.0.1", dead);
    let targets = ctx.pool.list().await;
    let target = targets
        .iter()
        .find(|t| t.host == key.host && t.port == key.port)
        .unwrap();
    assert_eq!(target.failure_count, 1);
}
