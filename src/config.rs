use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::gateway::rate_limit::RateLimitSettings;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Webhook signing secrets keyed by source name ("github", "linear",
    /// "slack"). An env var `HIVEGATE_SECRET_<SOURCE>` overrides the file.
    #[serde(default)]
    pub secrets: HashMap<String, String>,

    #[serde(default)]
    pub rate_limits: RateLimitSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Data directory; defaults to the platform data dir under `hivegate/`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Heartbeats older than this mark an agent unhealthy.
    #[serde(default = "default_health_stale_secs")]
    pub health_stale_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8700
}
fn default_health_stale_secs() -> u64 {
    120
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            health_stale_secs: default_health_stale_secs(),
        }
    }
}

impl GatewayConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: GatewayConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!(
            "Loaded config: api={}:{}, {} secret(s), {} source limit(s)",
            config.api.host,
            config.api.port,
            config.secrets.len(),
            config.rate_limits.sources.len()
        );
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.runtime.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("hivegate")
        })
    }

    pub fn secret_for(&self, source: &str) -> Option<String> {
        let env_key = format!("HIVEGATE_SECRET_{}", source.to_ascii_uppercase());
        if let Ok(secret) = std::env::var(&env_key) {
            if !secret.is_empty() {
                return Some(secret);
            }
        }
        self.secrets.get(source).cloned()
    }
}
