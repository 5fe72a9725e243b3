use async_trait::async_trait;

use super::types::{AgentMessage, AgentTask};

/// Mutable view handed to a processor for the duration of one task.
///
/// `messages` holds the actor's pending inbox, drained in FIFO order. The
/// processor consumes messages by removing them; anything left over is
/// written back to the front of the durable inbox when the task completes.
pub struct TaskContext {
    pub identity: String,
    pub messages: Vec<AgentMessage>,
    /// Count of outbound API calls made on behalf of this task; reported in
    /// the task's metrics.
    pub api_calls: u64,
}

/// Task semantics live behind this seam: the actor owns durability, ordering
/// and status transitions, the processor owns what a task *does*.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(
        &self,
        task: &AgentTask,
        ctx: &mut TaskContext,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Default processor: acknowledges the payload and consumes the pending
/// inbox. A task of type `fail` raises an error so callers can exercise the
/// failure path end to end.
pub struct EchoProcessor;

#[async_trait]
impl TaskProcessor for EchoProcessor {
    async fn process(
        &self,
        task: &AgentTask,
        ctx: &mut TaskContext,
    ) -> anyhow::Result<serde_json::Value> {
        if task.task_type == "fail" {
            let reason = task
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("task asked to fail");
            anyhow::bail!("{reason}");
        }

        let consumed: Vec<serde_json::Value> = ctx
            .messages
            .drain(..)
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "from": m.from_agent_id,
                    "type": m.message_type,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "echo": task.payload,
            "task_type": task.task_type,
            "consumed_messages": consumed,
        }))
    }
}
