// tests/load_balancer_tests.rs
use proxy_relay::config::{
    BackendConfig, Config, LoadBalancerAlgorithm, LoadBalancerConfig, RoundRobinAdvance,
};
use proxy_relay::proxy::ConnectionGuard;
use proxy_relay::ProxyContext;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

fn context(urls: &[String], algorithm: LoadBalancerAlgorithm) -> Arc<ProxyContext> {
    let config = Config {
        backends: urls
            .iter()
            .map(|u| BackendConfig {
                url: Url::parse(u).unwrap(),
            })
            .collect(),
        load_balancer: LoadBalancerConfig {
            algorithm,
            round_robin_advance: RoundRobinAdvance::PerRequest,
        },
        ..Config::default()
    };
    Arc::new(ProxyContext::new(config).unwrap())
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let urls: Vec<String> = (1..=3).map(|i| format!("http://10.0.0.{}:80", i)).collect();
    let ctx = context(&urls, LoadBalancerAlgorithm::RoundRobin);

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..30 {
        let backend = ctx.select_backend().unwrap();
        *counts.entry(backend.id.clone()).or_default() += 1;
    }

    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 10));
}

#[tokio::test]
async fn test_least_connections_prefers_idle_backend() {
    let urls: Vec<String> = (1..=3).map(|i| format!("http://10.0.0.{}:80", i)).collect();
    let ctx = context(&urls, LoadBalancerAlgorithm::LeastConnections);

    let all = ctx.backends.all().to_vec();
    let _busy: Vec<_> = (0..3)
        .map(|_| ConnectionGuard::acquire(all[0].clone()))
        .chain(std::iter::once(ConnectionGuard::acquire(all[1].clone())))
        .chain(std::iter::once(ConnectionGuard::acquire(all[2].clone())))
        .collect();

    // {A:3, B:1, C:1} picks B, the first of the tied minimum.
    assert_eq!(ctx.select_backend().unwrap().id, "10.0.0.2:80");
}

#[tokio::test]
async fn test_health_check_removes_unhealthy_backends() {
    let open = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = open.local_addr().unwrap().port();
    let dead_port = closed_port();

    let urls = vec![
        format!("tcp://127.0.0.1:{}", dead_port),
        format!("tcp://127.0.0.1:{}", open_port),
    ];
    let ctx = context(&urls, LoadBalancerAlgorithm::RoundRobin);

    let results = ctx.health.clone().check_all().await;
    assert_eq!(results.len(), 2);

    for _ in 0..4 {
        assert_eq!(ctx.select_backend().unwrap().port(), open_port);
    }

    let status = ctx.backends.status();
    assert!(status.iter().any(|b| !b.healthy));
}

#[tokio::test]
async fn test_no_reachable_backend_selects_nothing() {
    let urls = vec![format!("tcp://127.0.0.1:{}", closed_port())];
    let ctx = context(&urls, LoadBalancerAlgorithm::LeastConnections);

    ctx.health.clone().check_all().await;
    assert!(ctx.select_backend().is_none());
}
