// src/metrics/collector.rs
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub relayed_bytes_total: IntCounterVec,

    // Backend metrics
    pub backend_health_status: IntGaugeVec,

    // Pool metrics
    pub pool_targets: IntGaugeVec,
    pub target_validations_total: IntCounterVec,

    // System metrics
    pub active_connections: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("relay_requests_total", "Relayed connections and requests"),
            &["mode", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_request_duration_seconds",
                "Relay duration in seconds",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let relayed_bytes_total = IntCounterVec::new(
            Opts::new("relay_bytes_total", "Bytes relayed"),
            &["direction"],
        )?;
        registry.register(Box::new(relayed_bytes_total.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "relay_backend_health_status",
                "Backend reachability (1=reachable, 0=unreachable)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let pool_targets = IntGaugeVec::new(
            Opts::new("relay_pool_targets", "Upstream targets in the pool"),
            &["state"],
        )?;
        registry.register(Box::new(pool_targets.clone()))?;

        let target_validations_total = IntCounterVec::new(
            Opts::new(
                "relay_target_validations_total",
                "Validation probes by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(target_validations_total.clone()))?;

        let active_connections =
            IntGauge::new("relay_active_connections", "Connections being relayed")?;
        registry.register(Box::new(active_connections.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            relayed_bytes_total,
            backend_health_status,
            pool_targets,
            target_validations_total,
            active_connections,
        })
    }

    pub fn record_request(
        &self,
        mode: &str,
        outcome: &str,
        bytes_in: u64,
        bytes_out: u64,
        duration: Duration,
    ) {
        self.requests_total
            .with_label_values(&[mode, outcome])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[mode])
            .observe(duration.as_secs_f64());

        self.relayed_bytes_total
            .with_label_values(&["in"])
            .inc_by(bytes_in);
        self.relayed_bytes_total
            .with_label_values(&["out"])
            .inc_by(bytes_out);
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool) {
        let value = if healthy { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_target_counts(&self, active: usize, total: usize) {
        self.pool_targets
            .with_label_values(&["active"])
            .set(active as i64);
        self.pool_targets
            .with_label_values(&["total"])
            .set(total as i64);
    }

    pub fn record_validation(&self, reachable: bool) {
        let result = if reachable { "reachable" } else { "unreachable" };
        self.target_validations_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn increment_active_connections(&self) {
        self.active_connections.inc();
    }

    pub fn decrement_active_connections(&self) {
        self.active_connections.dec();
    }
}
