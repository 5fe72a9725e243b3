use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    Paused,
    Error,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
            AgentStatus::Terminated => "terminated",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(AgentStatus::Idle),
            "active" => Some(AgentStatus::Active),
            "paused" => Some(AgentStatus::Paused),
            "error" => Some(AgentStatus::Error),
            "terminated" => Some(AgentStatus::Terminated),
            _ => None,
        }
    }
}

/// Allowed status transitions. `Terminated` is terminal; `Error` only
/// accepts termination.
pub fn can_transition(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;
    if from == Terminated {
        return false;
    }
    match (from, to) {
        (_, Terminated) => true,
        (Error, _) => false,
        (_, Error) => true,
        (Idle, Active) => true,
        (Active, Idle) => true,
        (Idle, Paused) | (Active, Paused) => true,
        (Paused, Active) | (Paused, Idle) => true,
        _ => false,
    }
}

/// Durable record owned exclusively by the agent's actor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentInstance {
    pub identity: String,
    pub agent_type: String,
    pub status: AgentStatus,
    /// Ids of tasks currently in flight; always a subset of the task queue.
    pub current_task_ids: Vec<String>,
    /// Milliseconds since the UNIX epoch. Monotonically non-decreasing.
    pub last_heartbeat: i64,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentInstance {
    pub fn new(identity: &str, agent_type: &str, now_ms: i64) -> Self {
        Self {
            identity: identity.to_string(),
            agent_type: agent_type.to_string(),
            status: AgentStatus::Idle,
            current_task_ids: Vec::new(),
            last_heartbeat: now_ms,
            created_at: now_ms,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Advisory: the runtime performs no automatic retries.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    Retry,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TaskMetrics {
    pub execution_time_ms: u64,
    pub api_calls_count: u64,
    pub error_count: u64,
    pub retry_count: u32,
}

/// Produced exactly once per terminal task attempt.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metrics: TaskMetrics,
}

/// Inter-agent message. Enqueued into the receiving actor's inbox; the
/// receiver, not the sender, owns its lifecycle from then on.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: i64,
    pub correlation_id: Option<String>,
}

/// Immediate acknowledgement of message delivery.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageAck {
    pub status: String,
    pub message_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub identity: String,
    pub healthy: bool,
    pub status: AgentStatus,
    pub last_heartbeat: i64,
    pub heartbeat_age_ms: i64,
    pub stale_after_ms: i64,
}
