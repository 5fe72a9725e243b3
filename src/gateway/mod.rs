pub mod rate_limit;
pub mod signature;

use std::sync::Arc;

use axum::http::HeaderMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::agent::AgentRuntime;
use crate::core::agent::types::{AgentTask, TaskResult};
use crate::error::{Error, Result};
use rate_limit::RateLimiter;
use signature::{Provider, extract_signature_headers, validate_signature};

/// Per-sender identifier header. Absent means the source's shared pool.
pub const IDENTIFIER_HEADER: &str = "x-event-identifier";

const DEFAULT_IDENTIFIER: &str = "default";

/// Signing secrets looked up fresh on every event, so rotation needs no
/// restart.
pub trait SecretSource: Send + Sync {
    fn secret_for(&self, source: &str) -> Option<String>;
}

impl SecretSource for crate::config::GatewayConfig {
    fn secret_for(&self, source: &str) -> Option<String> {
        crate::config::GatewayConfig::secret_for(self, source)
    }
}

impl SecretSource for std::collections::HashMap<String, String> {
    fn secret_for(&self, source: &str) -> Option<String> {
        self.get(source).cloned()
    }
}

/// Front door for inbound webhook events. Every event runs the same
/// pipeline: resolve the provider, authenticate the signature, charge the
/// rate limit, then hand a task to the addressed agent. Authentication
/// always precedes rate accounting, so unauthenticated traffic can never
/// starve a legitimate sender's quota.
pub struct EventGateway {
    runtime: AgentRuntime,
    limiter: RateLimiter,
    secrets: Arc<dyn SecretSource>,
}

impl EventGateway {
    pub fn new(runtime: AgentRuntime, limiter: RateLimiter, secrets: Arc<dyn SecretSource>) -> Self {
        Self {
            runtime,
            limiter,
            secrets,
        }
    }

    pub async fn handle_inbound_event(
        &self,
        agent: &str,
        source: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<TaskResult> {
        let Some(provider) = Provider::from_source(source) else {
            return Err(Error::InvalidRequest(format!(
                "unsupported event source: {source}"
            )));
        };

        // No configured secret means nothing can be verified. Fail closed.
        let Some(secret) = self.secrets.secret_for(provider.as_str()) else {
            warn!("Rejecting {} event: no signing secret configured", provider.as_str());
            return Err(Error::Unauthenticated(format!(
                "no signing secret configured for {}",
                provider.as_str()
            )));
        };

        let Some(sig) = extract_signature_headers(provider, headers) else {
            return Err(Error::Unauthenticated(format!(
                "missing signature headers for {}",
                provider.as_str()
            )));
        };
        if !validate_signature(provider, &secret, body, &sig.signature, sig.timestamp.as_deref()) {
            warn!("Rejecting {} event for agent [{}]: bad signature", provider.as_str(), agent);
            return Err(Error::Unauthenticated("signature verification failed".into()));
        }

        // Only authenticated traffic reaches the counters.
        let identifier = headers
            .get(IDENTIFIER_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_IDENTIFIER);
        self.limiter.enforce(provider.as_str(), identifier).await?;

        let payload = match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(value) => value,
            // Slack form-encoded bodies and other non-JSON payloads are
            // carried through verbatim.
            Err(_) => serde_json::Value::String(String::from_utf8_lossy(body).into_owned()),
        };

        let task = AgentTask {
            id: Uuid::new_v4().to_string(),
            task_type: format!("webhook:{}", provider.as_str()),
            priority: 0,
            payload: serde_json::json!({
                "source": provider.as_str(),
                "identifier": identifier,
                "event": payload,
            }),
            created_at: 0,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
        };
        debug!(
            "Dispatching {} event to agent [{}] as task {}",
            provider.as_str(),
            agent,
            task.id
        );
        self.runtime.submit_task(agent, task).await
    }
}
