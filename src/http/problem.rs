//! Error rendering callback.
//!
//! The gates never write error responses themselves. They hand a
//! [`GuardError`] to a [`ProblemRenderer`], which owns the wire format.

use std::fmt;

use axum::{
    body::Body,
    http::{header, HeaderValue, Response},
};
use serde_json::json;

use crate::error::GuardError;

/// Turns a guard error into a client response.
pub trait ProblemRenderer: Send + Sync + fmt::Debug {
    /// Render `error` for the request at `instance` (the request path).
    fn render(&self, error: &GuardError, instance: &str) -> Response<Body>;
}

/// Renders `application/problem+json` bodies.
#[derive(Debug, Clone, Default)]
pub struct ProblemDetailsRenderer;

pub const PROBLEM_JSON: &str = "application/problem+json";

impl ProblemRenderer for ProblemDetailsRenderer {
    fn render(&self, error: &GuardError, instance: &str) -> Response<Body> {
        let status = error.status();
        let mut problem = json!({
            "type": "about:blank",
            "title": status.canonical_reason().unwrap_or("Error"),
            "status": status.as_u16(),
            "detail": error.to_string(),
            "instance": instance,
            "code": error.code(),
        });

        match error {
            GuardError::CircuitBreakerOpen { name } => {
                problem["breakerName"] = json!(name);
            }
            GuardError::MissingIdempotencyKey { header }
            | GuardError::InvalidIdempotencyKey { header } => {
                problem["header"] = json!(header);
            }
            _ => {}
        }

        let mut response = Response::new(Body::from(problem.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        response
    }
}
