// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Environment variables with this prefix override file values,
/// e.g. `PROXY_RELAY_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "PROXY_RELAY";

/// Load configuration from a file (YAML, JSON or TOML) layered with
/// `PROXY_RELAY_*` environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let config: Config = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config file {}", path.display()))?
        .try_deserialize()
        .context("Failed to parse config")?;

    Ok(config)
}

/// Write the effective configuration back out, format chosen by extension.
pub async fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> Result<()> {
    let path = path.as_ref();
    let extension = path.extension().and_then(|s| s.to_str());

    let contents = if extension == Some("yaml") || extension == Some("yml") {
        serde_yaml::to_string(config).context("Failed to serialize YAML config")?
    } else {
        serde_json::to_string_pretty(config).context("Failed to serialize JSON config")?
    };

    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}
