pub mod processor;
pub mod types;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::metrics::{self, MetricsSink};
use crate::core::storage::{KvStore, get_json, put_json};
use crate::error::{Error, Result};
use processor::{TaskContext, TaskProcessor};
use types::{
    AgentInstance, AgentMessage, AgentStatus, AgentTask, HealthReport, MessageAck, TaskMetrics,
    TaskResult, TaskStatus, can_transition,
};

/// One actor per identity for the lifetime of the process. The outer mutex
/// guards registration; each actor's own mutex serializes every operation
/// against that identity (single-writer).
pub type AgentRegistry = Arc<Mutex<HashMap<String, Arc<Mutex<AgentActor>>>>>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn state_key(identity: &str) -> String {
    format!("agent:{identity}")
}

/// Everything one actor persists, written through as a single record so a
/// crash can never observe the instance and its queues out of step.
#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedAgent {
    instance: AgentInstance,
    tasks: Vec<AgentTask>,
    inbox: VecDeque<AgentMessage>,
}

pub struct AgentActor {
    instance: AgentInstance,
    /// Append-only task log; completed entries are never mutated again.
    tasks: Vec<AgentTask>,
    inbox: VecDeque<AgentMessage>,
}

impl AgentActor {
    fn fresh(identity: &str, agent_type: &str) -> Self {
        Self {
            instance: AgentInstance::new(identity, agent_type, now_ms()),
            tasks: Vec::new(),
            inbox: VecDeque::new(),
        }
    }

    fn from_persisted(state: PersistedAgent) -> Self {
        Self {
            instance: state.instance,
            tasks: state.tasks,
            inbox: state.inbox,
        }
    }

    fn transition(&mut self, to: AgentStatus) -> Result<()> {
        let from = self.instance.status;
        if !can_transition(from, to) {
            return Err(Error::InvalidRequest(format!(
                "illegal status transition {} -> {} for agent {}",
                from.as_str(),
                to.as_str(),
                self.instance.identity
            )));
        }
        self.instance.status = to;
        Ok(())
    }

    fn touch_heartbeat(&mut self, now: i64) {
        // Monotone even if the wall clock steps backwards.
        self.instance.last_heartbeat = self.instance.last_heartbeat.max(now);
    }

    async fn persist(&self, store: &dyn KvStore) -> Result<()> {
        let state = PersistedAgent {
            instance: self.instance.clone(),
            tasks: self.tasks.clone(),
            inbox: self.inbox.clone(),
        };
        put_json(store, &state_key(&self.instance.identity), &state, None).await
    }
}

/// Owns the registry of actors and routes every operation through the
/// addressed actor's mutex.
#[derive(Clone)]
pub struct AgentRuntime {
    registry: AgentRegistry,
    store: Arc<dyn KvStore>,
    metrics: Arc<dyn MetricsSink>,
    processor: Arc<dyn TaskProcessor>,
    stale_after_ms: i64,
    default_agent_type: String,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<dyn KvStore>,
        metrics: Arc<dyn MetricsSink>,
        processor: Arc<dyn TaskProcessor>,
        stale_after_ms: i64,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            store,
            metrics,
            processor,
            stale_after_ms,
            default_agent_type: "worker".to_string(),
        }
    }

    /// Fetch the actor for an identity, creating and persisting it lazily on
    /// first contact.
    async fn actor(&self, identity: &str) -> Result<Arc<Mutex<AgentActor>>> {
        if identity.trim().is_empty() {
            return Err(Error::InvalidRequest("empty agent identity".into()));
        }

        let mut registry = self.registry.lock().await;
        if let Some(actor) = registry.get(identity) {
            return Ok(actor.clone());
        }

        let actor = match get_json::<PersistedAgent>(self.store.as_ref(), &state_key(identity))
            .await?
        {
            Some(state) => AgentActor::from_persisted(state),
            None => {
                info!("Creating agent actor [{}]", identity);
                let actor = AgentActor::fresh(identity, &self.default_agent_type);
                actor.persist(self.store.as_ref()).await?;
                actor
            }
        };

        let actor = Arc::new(Mutex::new(actor));
        registry.insert(identity.to_string(), actor.clone());
        Ok(actor)
    }

    /// Known identities: everything registered in memory plus everything
    /// durably stored.
    pub async fn list_agents(&self) -> Result<Vec<String>> {
        let mut identities: Vec<String> = self
            .store
            .list("agent:")
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix("agent:").map(str::to_string))
            .collect();
        for identity in self.registry.lock().await.keys() {
            if !identities.contains(identity) {
                identities.push(identity.clone());
            }
        }
        identities.sort();
        Ok(identities)
    }

    pub async fn get_status(&self, identity: &str) -> Result<AgentInstance> {
        let actor = self.actor(identity).await?;
        let actor = actor.lock().await;
        Ok(actor.instance.clone())
    }

    /// Health is recomputed freshly on every call, never cached.
    pub async fn health(&self, identity: &str) -> Result<HealthReport> {
        let actor = self.actor(identity).await?;
        let actor = actor.lock().await;
        let age = now_ms() - actor.instance.last_heartbeat;
        Ok(HealthReport {
            identity: actor.instance.identity.clone(),
            healthy: age <= self.stale_after_ms,
            status: actor.instance.status,
            last_heartbeat: actor.instance.last_heartbeat,
            heartbeat_age_ms: age,
            stale_after_ms: self.stale_after_ms,
        })
    }

    /// Process one task synchronously. The actor's mutex is held for the
    /// whole call, so tasks against one identity execute in submission
    /// order and the caller gets the terminal result back.
    pub async fn submit_task(&self, identity: &str, mut task: AgentTask) -> Result<TaskResult> {
        let actor = self.actor(identity).await?;
        let mut actor = actor.lock().await;

        match actor.instance.status {
            AgentStatus::Terminated => {
                return Err(Error::Terminated(identity.to_string()));
            }
            AgentStatus::Paused => {
                return Err(Error::InvalidRequest(format!(
                    "agent {identity} is paused"
                )));
            }
            AgentStatus::Error => {
                return Err(Error::InvalidRequest(format!(
                    "agent {identity} is in error state; terminate it"
                )));
            }
            AgentStatus::Idle | AgentStatus::Active => {}
        }

        if task.id.trim().is_empty() {
            return Err(Error::InvalidRequest("task id must be non-empty".into()));
        }
        if actor.tasks.iter().any(|t| t.id == task.id) {
            return Err(Error::InvalidRequest(format!(
                "duplicate task id {}",
                task.id
            )));
        }

        let started = now_ms();
        if task.created_at == 0 {
            task.created_at = started;
        }
        task.started_at = Some(started);

        if actor.instance.status == AgentStatus::Idle {
            actor.transition(AgentStatus::Active)?;
        }
        let task_id = task.id.clone();
        actor.instance.current_task_ids.push(task_id.clone());
        actor.tasks.push(task.clone());

        let mut ctx = TaskContext {
            identity: identity.to_string(),
            messages: actor.inbox.drain(..).collect(),
            api_calls: 0,
        };
        let outcome = self.processor.process(&task, &mut ctx).await;

        // Unconsumed messages go back to the front in their original order.
        for message in ctx.messages.into_iter().rev() {
            actor.inbox.push_front(message);
        }

        let finished = now_ms();
        let metrics = TaskMetrics {
            execution_time_ms: (finished - started).max(0) as u64,
            api_calls_count: ctx.api_calls,
            error_count: u64::from(outcome.is_err()),
            retry_count: task.retry_count,
        };
        let result = match outcome {
            Ok(value) => TaskResult {
                task_id: task_id.clone(),
                status: TaskStatus::Success,
                result: Some(value),
                error: None,
                metrics,
            },
            Err(e) => {
                warn!("Task {} failed on agent [{}]: {}", task_id, identity, e);
                TaskResult {
                    task_id: task_id.clone(),
                    status: TaskStatus::Failure,
                    result: None,
                    error: Some(e.to_string()),
                    metrics,
                }
            }
        };

        // Terminal attempt recorded either way; the task entry is immutable
        // from here on.
        if let Some(entry) = actor.tasks.iter_mut().find(|t| t.id == task_id) {
            entry.completed_at = Some(finished);
        }
        actor.instance.current_task_ids.retain(|id| id != &task_id);
        actor.touch_heartbeat(finished);
        if actor.instance.current_task_ids.is_empty() {
            actor.transition(AgentStatus::Idle)?;
        }

        if let Err(e) = actor.persist(self.store.as_ref()).await {
            // Durable state and memory no longer agree; park the actor until
            // it is terminated.
            actor.instance.status = AgentStatus::Error;
            return Err(e);
        }

        self.metrics.emit(metrics::event([
            ("event", "task_completed".into()),
            ("agent", identity.into()),
            ("task_id", task_id.as_str().into()),
            (
                "status",
                match result.status {
                    TaskStatus::Success => "success",
                    TaskStatus::Failure => "failure",
                    TaskStatus::Retry => "retry",
                }
                .into(),
            ),
            (
                "execution_time_ms",
                result.metrics.execution_time_ms.into(),
            ),
            ("api_calls_count", result.metrics.api_calls_count.into()),
            ("error_count", result.metrics.error_count.into()),
            ("retry_count", result.metrics.retry_count.into()),
        ]));

        Ok(result)
    }

    /// Append to the durable inbox and ack. Handling happens on a later
    /// task run, never synchronously with delivery.
    pub async fn submit_message(
        &self,
        identity: &str,
        mut message: AgentMessage,
    ) -> Result<MessageAck> {
        let actor = self.actor(identity).await?;
        let mut actor = actor.lock().await;

        if actor.instance.status == AgentStatus::Terminated {
            return Err(Error::Terminated(identity.to_string()));
        }
        if !message.to_agent_id.is_empty() && message.to_agent_id != identity {
            return Err(Error::InvalidRequest(format!(
                "message addressed to {} delivered to {}",
                message.to_agent_id, identity
            )));
        }

        if message.id.trim().is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        message.to_agent_id = identity.to_string();
        if message.timestamp == 0 {
            message.timestamp = now_ms();
        }

        let message_id = message.id.clone();
        actor.inbox.push_back(message);
        actor.persist(self.store.as_ref()).await?;

        Ok(MessageAck {
            status: "received".to_string(),
            message_id,
        })
    }

    pub async fn pause(&self, identity: &str) -> Result<AgentStatus> {
        let actor = self.actor(identity).await?;
        let mut actor = actor.lock().await;
        if actor.instance.status == AgentStatus::Terminated {
            return Err(Error::Terminated(identity.to_string()));
        }
        actor.transition(AgentStatus::Paused)?;
        actor.persist(self.store.as_ref()).await?;
        Ok(actor.instance.status)
    }

    /// Resume lands on `idle`, not `active`: tasks run to completion inside
    /// `submit_task` while the actor's mutex is held, so a paused actor can
    /// never have a task in flight to return to.
    pub async fn resume(&self, identity: &str) -> Result<AgentStatus> {
        let actor = self.actor(identity).await?;
        let mut actor = actor.lock().await;
        if actor.instance.status == AgentStatus::Terminated {
            return Err(Error::Terminated(identity.to_string()));
        }
        actor.transition(AgentStatus::Idle)?;
        actor.persist(self.store.as_ref()).await?;
        Ok(actor.instance.status)
    }

    /// Idempotent: terminating an already-terminated actor still succeeds.
    /// Instance data persists; every later mutating call fails typed.
    pub async fn terminate(&self, identity: &str) -> Result<()> {
        let actor = self.actor(identity).await?;
        let mut actor = actor.lock().await;
        if actor.instance.status == AgentStatus::Terminated {
            return Ok(());
        }
        actor.transition(AgentStatus::Terminated)?;
        actor.touch_heartbeat(now_ms());
        actor.persist(self.store.as_ref()).await?;
        info!("Agent [{}] terminated", identity);
        Ok(())
    }
}
