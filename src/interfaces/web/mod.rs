pub mod handlers;
mod router;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use tracing::info;

use crate::core::agent::AgentRuntime;
use crate::core::lifecycle::LifecycleComponent;
use crate::gateway::EventGateway;

#[derive(Clone)]
pub struct AppState {
    pub runtime: AgentRuntime,
    pub gateway: Arc<EventGateway>,
    pub api_port: u16,
}

pub fn build_router(state: AppState) -> Router {
    router::build_api_router(state)
}

/// HTTP front end. Binds on start and serves until the process exits.
pub struct ApiServer {
    state: AppState,
    api_host: String,
}

impl ApiServer {
    pub fn new(state: AppState, api_host: String) -> Self {
        Self { state, api_host }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = self.state.clone();
        let addr = format!("{}:{}", self.api_host, state.api_port);

        tokio::spawn(async move {
            let app = build_router(state);
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("API server running at http://{addr}");
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!("API server crashed: {}", e);
                    }
                }
                Err(e) => tracing::error!("API server failed to bind {addr}: {}", e),
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::core::agent::processor::EchoProcessor;
    use crate::core::metrics::NullSink;
    use crate::core::storage::MemoryStore;
    use crate::gateway::rate_limit::{RateLimiter, RateLimitSettings};

    let store = Arc::new(MemoryStore::new());
    let runtime = AgentRuntime::new(
        store.clone(),
        Arc::new(NullSink),
        Arc::new(EchoProcessor),
        60_000,
    );
    let limiter = RateLimiter::new(store, Arc::new(RateLimitSettings::default()));
    let mut secrets = std::collections::HashMap::new();
    secrets.insert("github".to_string(), "test-secret".to_string());
    let gateway = Arc::new(EventGateway::new(runtime.clone(), limiter, Arc::new(secrets)));

    AppState {
        runtime,
        gateway,
        api_port: 17890,
    }
}
