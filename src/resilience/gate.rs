//! Circuit breaker admission gate.
//!
//! # Responsibilities
//! - Resolve the breaker name and protection flag for each request
//! - Ask the breaker for permission before calling downstream
//! - Record the outcome and elapsed time of every permitted call
//! - Render rejections through the configured [`ProblemRenderer`]
//!
//! # Design Decisions
//! - The policy travels with the request (extensions), never on the service
//! - Downstream errors are recorded and returned unchanged
//! - No timeout here; the server's `TimeoutLayer` sits outside this gate
//! - A permitted call that is cancelled hands its permission back
//!
//! # Timeouts
//! A request cut off by the server's `TimeoutLayer` is a cancellation here:
//! its permission is released and no outcome is recorded. A backend that
//! hangs instead of failing therefore never raises the failure rate. Bound
//! such calls inside the handler (a client timeout that returns an error or
//! a 5xx) so the gate sees them as failures.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{Request, Response},
};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};

use crate::error::GuardError;
use crate::http::problem::ProblemRenderer;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{BreakerRegistry, CircuitBreaker};
use crate::routing::RouteRuleSet;

/// Layer applying [`CircuitBreakerService`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    rules: Arc<RouteRuleSet>,
    registry: Arc<dyn BreakerRegistry>,
    renderer: Arc<dyn ProblemRenderer>,
    record_server_errors: bool,
}

impl CircuitBreakerLayer {
    pub fn new(
        rules: Arc<RouteRuleSet>,
        registry: Arc<dyn BreakerRegistry>,
        renderer: Arc<dyn ProblemRenderer>,
    ) -> Self {
        Self {
            rules,
            registry,
            renderer,
            record_server_errors: false,
        }
    }

    /// Count 5xx responses as failures.
    pub fn record_server_errors(mut self, enabled: bool) -> Self {
        self.record_server_errors = enabled;
        self
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Gates downstream calls on breaker permission.
#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    layer: CircuitBreakerLayer,
}

impl<S> Service<Request<Body>> for CircuitBreakerService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let policy = self.layer.rules.policy_for(&mut req);

        // The ready service goes into the future; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !policy.protected_by_breaker {
            return Box::pin(inner.call(req));
        }

        let layer = self.layer.clone();
        Box::pin(async move {
            let name = policy.breaker_name;
            let breaker = layer.registry.breaker(&name);

            if !breaker.try_acquire_permission() {
                tracing::warn!(
                    breaker = %name,
                    method = %req.method(),
                    path = %req.uri().path(),
                    "Circuit breaker rejected request"
                );
                metrics::record_breaker_rejection(&name);
                let error = GuardError::CircuitBreakerOpen { name };
                return Ok(layer.renderer.render(&error, req.uri().path()));
            }

            let permit = Permit::new(breaker);
            let start = Instant::now();
            let result = inner.call(req).await;
            let elapsed = start.elapsed();

            match &result {
                Ok(response)
                    if layer.record_server_errors && response.status().is_server_error() =>
                {
                    permit.error(elapsed);
                }
                Ok(_) => permit.success(elapsed),
                Err(_) => permit.error(elapsed),
            }

            result
        })
    }
}

/// A granted permission that must be settled exactly once.
struct Permit {
    breaker: Option<Arc<dyn CircuitBreaker>>,
}

impl Permit {
    fn new(breaker: Arc<dyn CircuitBreaker>) -> Self {
        Self {
            breaker: Some(breaker),
        }
    }

    fn success(mut self, elapsed: Duration) {
        if let Some(breaker) = self.breaker.take() {
            breaker.on_success(elapsed);
            metrics::record_breaker_call(breaker.name(), "success", elapsed);
        }
    }

    fn error(mut self, elapsed: Duration) {
        if let Some(breaker) = self.breaker.take() {
            breaker.on_error(elapsed);
            tracing::debug!(
                breaker = %breaker.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Recorded downstream failure"
            );
            metrics::record_breaker_call(breaker.name(), "error", elapsed);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            tracing::debug!(breaker = %breaker.name(), "Call cancelled, releasing permission");
            breaker.release_permission();
        }
    }
}
