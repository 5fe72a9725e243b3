use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use hivegate::config::GatewayConfig;
use hivegate::core::agent::AgentRuntime;
use hivegate::core::agent::processor::EchoProcessor;
use hivegate::core::lifecycle::LifecycleManager;
use hivegate::core::metrics::LogSink;
use hivegate::core::storage::SqliteStore;
use hivegate::gateway::EventGateway;
use hivegate::gateway::rate_limit::{RateLimiter, SharedRules};
use hivegate::interfaces::web::{ApiServer, AppState};

fn config_path() -> PathBuf {
    if let Some(arg) = std::env::args().nth(1) {
        return PathBuf::from(arg);
    }
    if let Ok(path) = std::env::var("HIVEGATE_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hivegate")
        .join("config.toml")
}

async fn run() -> Result<()> {
    let config = GatewayConfig::load(config_path()).await?;

    let data_dir = config.data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store = Arc::new(SqliteStore::open(data_dir.join("hivegate.db"))?);

    let runtime = AgentRuntime::new(
        store.clone(),
        Arc::new(LogSink),
        Arc::new(EchoProcessor),
        (config.runtime.health_stale_secs * 1000) as i64,
    );
    let limiter = RateLimiter::new(
        store.clone(),
        Arc::new(SharedRules::new(config.rate_limits.clone())),
    );
    let gateway = Arc::new(EventGateway::new(
        runtime.clone(),
        limiter,
        Arc::new(config.clone()),
    ));

    let state = AppState {
        runtime,
        gateway,
        api_port: config.api.port,
    };
    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        state,
        config.api.host.clone(),
    ))));
    lifecycle.start().await?;

    // Opportunistic cleanup of expired counters left behind by idle keys.
    let purged = store.purge_expired().await?;
    if purged > 0 {
        info!("Purged {} expired storage entries", purged);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    lifecycle.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(e) = run().await {
        tracing::error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}
