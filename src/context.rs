// src/context.rs
// Everything a listener, relay or background loop needs, built once
// per engine from a validated Config.
use crate::config::Config;
use crate::error::{ConfigError, EngineError};
use crate::health::{HealthChecker, ValidationProbe};
use crate::load_balancer::{create_load_balancer, LoadBalancer};
use crate::metrics::{MetricsCollector, MetricsRegistry, StatsHandle};
use crate::pool::ProxyPool;
use crate::proxy::{Backend, BackendSet, UpstreamTransport};
use std::sync::Arc;
use url::Url;

pub struct ProxyContext {
    pub config: Config,
    pub backends: Arc<BackendSet>,
    pub selector: Arc<dyn LoadBalancer>,
    pub pool: Arc<ProxyPool>,
    pub transport: Arc<UpstreamTransport>,
    pub health: Arc<HealthChecker>,
    pub stats: Arc<StatsHandle>,
    pub metrics: Arc<MetricsCollector>,
    pub registry: Arc<MetricsRegistry>,
}

impl ProxyContext {
    pub fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;

        let registry = Arc::new(MetricsRegistry::new()?);
        let metrics = registry.collector();

        let backends = Arc::new(BackendSet::new(&config.backends)?);
        let selector = create_load_balancer(&config.load_balancer);

        let transport = Arc::new(
            UpstreamTransport::new(config.timeouts.connect(), config.timeouts.request())
                .map_err(|e| ConfigError::Invalid(format!("outbound client: {}", e)))?,
        );

        let validation_url = Url::parse(&config.pool.validation_url)
            .map_err(|e| ConfigError::Invalid(format!("pool.validation_url: {}", e)))?;
        let probe = Arc::new(ValidationProbe::new(
            transport.clone(),
            validation_url,
            config.pool.validation_timeout(),
        ));
        let pool = Arc::new(ProxyPool::new(probe, Some(metrics.clone())));

        let health = Arc::new(HealthChecker::new(
            config.health_check.clone(),
            backends.clone(),
            Some(metrics.clone()),
        ));

        Ok(Self {
            config,
            backends,
            selector,
            pool,
            transport,
            health,
            stats: Arc::new(StatsHandle::new()),
            metrics,
            registry,
        })
    }

    /// Next backend among the currently reachable ones.
    pub fn select_backend(&self) -> Option<Arc<Backend>> {
        let healthy = self.backends.healthy();
        self.selector.select_backend(&healthy)
    }

    pub fn is_tls(&self) -> bool {
        self.config.server.tls.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn refuses_config_without_backends() {
        let result = ProxyContext::new(Config::default());
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::NoBackends))
        ));
    }

    #[test]
    fn selects_from_configured_backends() {
        let config = Config {
            backends: vec![BackendConfig {
                url: Url::parse("http://127.0.0.1:8001").unwrap(),
            }],
            ..Config::default()
        };
        let ctx = ProxyContext::new(config).unwrap();
        let backend = ctx.select_backend().unwrap();
        assert_eq!(backend.id, "127.0.0.1:8001");
    }
}
