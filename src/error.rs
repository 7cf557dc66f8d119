//! Errors produced by the guard layers themselves.
//!
//! Downstream failures are never wrapped in these types; they pass through
//! the gates unchanged. A `GuardError` is always terminal at this layer and is
//! handed to a [`ProblemRenderer`](crate::http::problem::ProblemRenderer)
//! instead of being propagated.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors the pipeline raises on its own behalf.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardError {
    /// An idempotent route was called without an idempotency key.
    #[error("Idempotency key is missing (expected header {header})")]
    MissingIdempotencyKey { header: String },

    /// The idempotency key header is not valid UTF-8.
    #[error("Idempotency key in header {header} is not valid UTF-8")]
    InvalidIdempotencyKey { header: String },

    /// The breaker guarding this route denied the call.
    #[error("Circuit breaker '{name}' is open")]
    CircuitBreakerOpen { name: String },

    /// Another request holding the same key is still executing.
    #[error("A request with idempotency key '{key}' is already in progress")]
    IdempotencyInProgress { key: String },

    /// The downstream response body could not be read for recording.
    #[error("Failed to capture downstream response: {0}")]
    ResponseCapture(String),
}

impl GuardError {
    /// HTTP status the error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            GuardError::MissingIdempotencyKey { .. } => StatusCode::BAD_REQUEST,
            GuardError::InvalidIdempotencyKey { .. } => StatusCode::BAD_REQUEST,
            GuardError::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GuardError::IdempotencyInProgress { .. } => StatusCode::CONFLICT,
            GuardError::ResponseCapture(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::MissingIdempotencyKey { .. } => "missing_idempotency_key",
            GuardError::InvalidIdempotencyKey { .. } => "invalid_idempotency_key",
            GuardError::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            GuardError::IdempotencyInProgress { .. } => "idempotency_in_progress",
            GuardError::ResponseCapture(_) => "response_capture_failed",
        }
    }
}
