use axum::{Json, extract::Path, extract::State};

use crate::core::agent::types::{AgentMessage, AgentTask};
use crate::error::{Error, Result};
use crate::interfaces::web::AppState;

pub async fn list_agents(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let agents = state.runtime.list_agents().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "agents": agents,
    })))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let instance = state.runtime.get_status(&agent).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "agent": instance,
    })))
}

pub async fn get_health(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let report = state.runtime.health(&agent).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "health": report,
    })))
}

/// Synchronous task submission: the response carries the terminal result.
pub async fn submit_task(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    body: String,
) -> Result<Json<serde_json::Value>> {
    let task: AgentTask = serde_json::from_str(&body)
        .map_err(|e| Error::InvalidRequest(format!("invalid task payload: {e}")))?;
    let result = state.runtime.submit_task(&agent, task).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "result": result,
    })))
}

pub async fn submit_message(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    body: String,
) -> Result<Json<serde_json::Value>> {
    let message: AgentMessage = serde_json::from_str(&body)
        .map_err(|e| Error::InvalidRequest(format!("invalid message payload: {e}")))?;
    let ack = state.runtime.submit_message(&agent, message).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "ack": ack,
    })))
}

pub async fn pause_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let status = state.runtime.pause(&agent).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "status": status,
    })))
}

pub async fn resume_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let status = state.runtime.resume(&agent).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "status": status,
    })))
}

pub async fn terminate_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.runtime.terminate(&agent).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "status": "terminated",
    })))
}
