use axum::{Json, extract::Path, extract::State, http::HeaderMap};

use crate::error::Result;
use crate::interfaces::web::AppState;

/// Public webhook ingestion endpoint. The raw body is kept as received so
/// the signature is computed over exactly the bytes the sender signed.
pub async fn inbound_event(
    State(state): State<AppState>,
    Path((agent, source)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>> {
    let result = state
        .gateway
        .handle_inbound_event(&agent, &source, &headers, body.as_bytes())
        .await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "result": result,
    })))
}
