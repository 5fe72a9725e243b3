use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Domain error taxonomy. Every variant tells the caller whether to fix the
/// request, retry later, or give up on the agent entirely.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input. Caller's fault, not retryable without correction.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Signature or timestamp validation failed. Caller's fault.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Transient. Retryable after `retry_after_secs`.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Task-specific failure, recorded as a terminal failed attempt.
    /// Surfaces inside a `TaskResult`, never as a transport error.
    #[error("task processing failed: {0}")]
    TaskProcessing(String),

    /// The actor no longer accepts work.
    #[error("agent terminated: {0}")]
    Terminated(String),

    /// Infrastructure fault. Propagated, never swallowed.
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl Error {
    /// Whether a retry of the same request may succeed without changes.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded { .. } | Error::Storage(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::TaskProcessing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Terminated(_) => StatusCode::GONE,
            Error::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Error::TaskProcessing(_) => "task_processing_failure",
            Error::Terminated(_) => "terminated",
            Error::Storage(_) => "storage_unavailable",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(format!("invalid JSON: {e}"))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
            "retryable": self.retryable(),
        });
        if let Error::RateLimitExceeded { retry_after_secs } = &self {
            body["retry_after_seconds"] = serde_json::json!(retry_after_secs);
        }

        let mut response = (self.status_code(), Json(body)).into_response();
        if let Error::RateLimitExceeded { retry_after_secs } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
