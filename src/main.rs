// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use proxy_relay::config::{self, BackendConfig, Config, LoadBalancerAlgorithm, RelayMode};
use proxy_relay::Engine;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "proxy-relay", version, about = "Load-balancing relay with a rotating upstream proxy pool")]
struct Cli {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend URL, repeatable; replaces the configured backends
    #[arg(short, long = "backend")]
    backends: Vec<Url>,

    /// Relay mode: tcp or http
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<RelayMode>,

    /// Load balancing algorithm: round-robin or least-connections
    #[arg(short, long)]
    algorithm: Option<LoadBalancerAlgorithm>,

    /// Upstream proxy list, one `host:port[:type]` per line
    #[arg(long)]
    proxies: Option<PathBuf>,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,
}

fn parse_mode(s: &str) -> Result<RelayMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(RelayMode::Tcp),
        "http" => Ok(RelayMode::Http),
        other => Err(format!("unknown mode {} (expected tcp or http)", other)),
    }
}

impl Cli {
    fn apply(self, mut config: Config) -> (Config, Option<PathBuf>) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if !self.backends.is_empty() {
            config.backends = self
                .backends
                .into_iter()
                .map(|url| BackendConfig { url })
                .collect();
        }
        if let Some(mode) = self.mode {
            config.server.mode = mode;
        }
        if let Some(algorithm) = self.algorithm {
            config.load_balancer.algorithm = algorithm;
        }
        if let Some(proxies) = self.proxies {
            config.pool.proxies_file = Some(proxies);
            config.pool.enabled = true;
        }
        (config, self.save_config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    let (config, save_path) = cli.apply(config);

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("proxy_relay={}", config.logging.level).parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    if let Some(path) = save_path {
        config::save_config(&config, &path).await?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    let proxies_file = config.pool.proxies_file.clone();
    let engine = Engine::new(config).context("Refusing to start")?;

    if let Some(path) = proxies_file {
        match engine.load_from_file(&path).await {
            Ok(count) => info!("Loaded {} upstream targets from {}", count, path.display()),
            Err(e) => warn!("Could not load {}: {}", path.display(), e),
        }
    }

    engine.start().await?;

    shutdown_signal().await;
    engine.stop().await;

    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
