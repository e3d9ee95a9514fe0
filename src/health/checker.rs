// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendSet};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Periodic TCP-connect reachability check of the fixed backends.
pub struct HealthChecker {
    config: HealthCheckConfig,
    backends: Arc<BackendSet>,
    metrics: Option<Arc<MetricsCollector>>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        backends: Arc<BackendSet>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            config,
            backends,
            metrics,
        }
    }

    pub async fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = interval(self.config.interval());

        info!(
            "Starting health checker with interval: {:?}",
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    self.clone().check_all().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health checker shutting down");
    }

    /// One sweep over every backend. A failing or panicking check only
    /// affects its own backend.
    pub async fn check_all(self: Arc<Self>) -> Vec<HealthCheckResult> {
        let mut tasks = Vec::new();

        for backend in self.backends.all().iter().cloned() {
            let checker = self.clone();
            tasks.push(tokio::spawn(async move { checker.check_backend(backend).await }));
        }

        let results = futures::future::join_all(tasks).await;

        let mut healthy_count = 0;
        let mut unhealthy_count = 0;
        let mut checked = Vec::with_capacity(results.len());

        for result in results {
            match result {
                Ok(check_result) => {
                    if check_result.healthy {
                        healthy_count += 1;
                    } else {
                        unhealthy_count += 1;
                    }
                    checked.push(check_result);
                }
                Err(e) => {
                    error!("Health check task failed: {}", e);
                    unhealthy_count += 1;
                }
            }
        }

        debug!(
            "Health check complete: {} healthy, {} unhealthy",
            healthy_count, unhealthy_count
        );
        checked
    }

    async fn check_backend(&self, backend: Arc<Backend>) -> HealthCheckResult {
        let start = Instant::now();

        let result = timeout(
            self.config.timeout(),
            TcpStream::connect((backend.host(), backend.port())),
        )
        .await;

        let response_time_ms = start.elapsed().as_millis() as u64;

        let (healthy, error) = match result {
            Ok(Ok(_stream)) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("connect timeout".to_string())),
        };

        let changed = self.backends.set_health(&backend, healthy);

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_health(&backend.id, healthy);
        }

        if changed {
            if healthy {
                info!("Backend {} is reachable", backend.id);
            } else {
                warn!("Backend {} is unreachable: {:?}", backend.id, error);
            }
        } else {
            debug!(
                "Health check: {} is {}",
                backend.id,
                if healthy { "healthy" } else { "unhealthy" }
            );
        }

        HealthCheckResult {
            backend_id: backend.id.clone(),
            healthy,
            response_time_ms,
            error,
        }
    }
}
