// src/engine.rs
// Lifecycle and administrative surface of one relay instance.
use crate::config::{Config, RoundRobinAdvance};
use crate::context::ProxyContext;
use crate::error::{AdminInputError, EngineError};
use crate::load_balancer::LoadBalancer;
use crate::metrics::TrafficSnapshot;
use crate::pool::{
    wait_for_tick, Credentials, Target, TargetCounts, TargetKey, TargetKind, TargetSnapshot,
    ValidationSummary,
};
use crate::proxy::BackendStatus;
use crate::server::{admin, bind_tcp, load_tls_acceptor, ServerBuilder};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    listen_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub listen_address: String,
    pub admin_address: Option<String>,
    pub target_addresses: Vec<String>,
    pub algorithm: &'static str,
    pub current_target: Option<TargetSnapshot>,
    pub target_counts: TargetCounts,
    pub traffic: TrafficSnapshot,
    pub per_target: Vec<TargetSnapshot>,
    pub backends: Vec<BackendStatus>,
}

pub struct Engine {
    ctx: Arc<ProxyContext>,
    runtime: Mutex<Option<RunningState>>,
}

impl Engine {
    /// Refuses configurations without backends.
    pub fn new(config: Config) -> Result<Arc<Self>, EngineError> {
        Ok(Self::from_context(Arc::new(ProxyContext::new(config)?)))
    }

    pub fn from_context(ctx: Arc<ProxyContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            runtime: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Bind the listener and start the background loops. Returns the
    /// bound address; on a running engine this only warns.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, EngineError> {
        let mut runtime = self.runtime.lock().await;
        if let Some(state) = runtime.as_ref() {
            warn!(addr = %state.listen_addr, "Engine already running");
            return Ok(state.listen_addr);
        }

        let config = &self.ctx.config;
        let tls = match &config.server.tls {
            Some(tls) => Some(load_tls_acceptor(tls).await?),
            None => None,
        };

        let address = config.server.listen_address();
        let listener = bind_tcp(&address).await?;
        let listen_addr = listener
            .local_addr()
            .map_err(|source| EngineError::Bind {
                addr: address.clone(),
                source,
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            ServerBuilder::new(self.ctx.clone(), listener)
                .with_tls(tls)
                .serve(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            self.ctx.health.clone().start(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(self.ctx.pool.clone().rotation_loop(
            config.pool.rotation_interval(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(self.ctx.pool.clone().validation_loop(
            config.pool.validation_interval(),
            shutdown_rx.clone(),
        )));

        if config.load_balancer.round_robin_advance == RoundRobinAdvance::PerTick {
            tasks.push(tokio::spawn(advance_loop(
                self.ctx.selector.clone(),
                config.pool.rotation_interval(),
                shutdown_rx.clone(),
            )));
        }

        let admin_addr = if config.metrics.enabled {
            let addr = format!("{}:{}", config.server.host, config.metrics.port);
            let addr: SocketAddr = addr.parse().map_err(|_| {
                crate::error::ConfigError::InvalidListenAddress(addr.clone())
            })?;
            let (bound, task) = admin::spawn(
                addr,
                Arc::downgrade(self),
                config.metrics.path.clone(),
                shutdown_rx.clone(),
            )?;
            tasks.push(task);
            Some(bound)
        } else {
            None
        };

        info!(
            %listen_addr,
            mode = ?config.server.mode,
            algorithm = self.ctx.selector.name(),
            backends = self.ctx.backends.all().len(),
            "Engine started"
        );

        *runtime = Some(RunningState {
            shutdown_tx,
            listen_addr,
            admin_addr,
            tasks,
        });
        Ok(listen_addr)
    }

    /// Close the listener and wait for the background loops to exit.
    /// In-flight relays drain on their own. Safe to call repeatedly.
    pub async fn stop(&self) {
        let state = self.runtime.lock().await.take();
        let Some(state) = state else {
            debug!("Engine not running");
            return;
        };

        let _ = state.shutdown_tx.send(true);
        for task in state.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!(addr = %state.listen_addr, "Engine stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Register an upstream target. False on a duplicate address or on
    /// input that does not describe a target.
    pub async fn add_target(
        &self,
        host: &str,
        port: u16,
        kind: &str,
        credentials: Option<Credentials>,
    ) -> bool {
        match build_target(host, port, kind, credentials) {
            Ok(target) => self.ctx.pool.add(target).await,
            Err(e) => {
                warn!("Rejected target {}:{}: {}", host, port, e);
                false
            }
        }
    }

    pub async fn remove_target(&self, host: &str, port: u16) -> bool {
        let key = TargetKey::new(host, port);
        let removed = self.ctx.pool.remove(&key).await;
        if removed {
            self.ctx.transport.forget(&key);
        }
        removed
    }

    pub async fn list_targets(&self) -> Vec<TargetSnapshot> {
        self.ctx.pool.list().await
    }

    pub async fn rotate(&self) {
        self.ctx.pool.rotate().await;
    }

    pub async fn validate_all(&self) -> ValidationSummary {
        self.ctx.pool.validate_all().await
    }

    pub async fn load_from_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<usize> {
        self.ctx.pool.load_from_file(path).await
    }

    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<usize> {
        self.ctx.pool.save_to_file(path).await
    }

    pub fn reset_stats(&self) {
        self.ctx.stats.reset();
        info!("Traffic statistics reset");
    }

    pub async fn status(&self) -> EngineStatus {
        let (running, listen_address, admin_address) = {
            let runtime = self.runtime.lock().await;
            match runtime.as_ref() {
                Some(state) => (
                    true,
                    state.listen_addr.to_string(),
                    state.admin_addr.map(|a| a.to_string()),
                ),
                None => (false, self.ctx.config.server.listen_address(), None),
            }
        };

        EngineStatus {
            running,
            listen_address,
            admin_address,
            target_addresses: self.ctx.backends.all().iter().map(|b| b.id.clone()).collect(),
            algorithm: self.ctx.selector.name(),
            current_target: self
                .ctx
                .pool
                .current_target()
                .await
                .map(|t| t.snapshot()),
            target_counts: self.ctx.pool.counts().await,
            traffic: self.ctx.stats.snapshot(),
            per_target: self.ctx.pool.list().await,
            backends: self.ctx.backends.status(),
        }
    }
}

fn build_target(
    host: &str,
    port: u16,
    kind: &str,
    credentials: Option<Credentials>,
) -> Result<Target, AdminInputError> {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(AdminInputError::EmptyHost);
    }
    if port == 0 {
        return Err(AdminInputError::InvalidPort(port.to_string()));
    }
    let kind: TargetKind = kind.parse()?;

    let target = Target::new(host, port, kind);
    Ok(match credentials {
        Some(credentials) => target.with_credentials(credentials),
        None => target,
    })
}

async fn advance_loop(
    selector: Arc<dyn LoadBalancer>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while wait_for_tick(every, &mut shutdown).await {
        selector.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_target_rejects_bad_input() {
        assert_eq!(
            build_target(" ", 8080, "http", None).unwrap_err(),
            AdminInputError::EmptyHost
        );
        assert!(matches!(
            build_target("10.0.0.1", 0, "http", None),
            Err(AdminInputError::InvalidPort(_))
        ));
        assert!(matches!(
            build_target("10.0.0.1", 8080, "gopher", None),
            Err(AdminInputError::UnknownKind(_))
        ));

        let target = build_target("10.0.0.1", 1080, "SOCKS5", None).unwrap();
        assert_eq!(target.kind(), TargetKind::Socks5);

        let target = build_target("[::1]", 3128, "http", None).unwrap();
        assert_eq!(target.key(), &TargetKey::new("::1", 3128));
    }
}
