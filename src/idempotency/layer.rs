//! Idempotency middleware.
//!
//! # Responsibilities
//! - Require a key on idempotent routes
//! - Replay stored responses without calling downstream
//! - Execute a key at most once and store its response
//! - Hold or reject concurrent requests for an in-flight key
//!
//! # Design Decisions
//! - The record is stored before the response leaves this layer
//! - A claim is released if downstream fails, the body cannot be read, or
//!   the future is dropped

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, header::InvalidHeaderName, HeaderName, HeaderValue, Request, Response},
};
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tower::{Layer, Service};

use crate::config::{IdempotencyConfig, InFlightPolicy};
use crate::error::GuardError;
use crate::http::problem::ProblemRenderer;
use crate::idempotency::store::{Claim, IdempotencyRecord, IdempotencyStore};
use crate::observability::{capture::buffer_response, metrics};
use crate::routing::RouteRuleSet;

/// Layer applying [`IdempotencyService`].
#[derive(Debug, Clone)]
pub struct IdempotencyLayer {
    rules: Arc<RouteRuleSet>,
    store: Arc<dyn IdempotencyStore>,
    renderer: Arc<dyn ProblemRenderer>,
    header: HeaderName,
    in_flight: InFlightPolicy,
    wait_timeout: Duration,
    retry_after: HeaderValue,
}

impl IdempotencyLayer {
    pub fn new(
        rules: Arc<RouteRuleSet>,
        store: Arc<dyn IdempotencyStore>,
        renderer: Arc<dyn ProblemRenderer>,
        config: &IdempotencyConfig,
    ) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            rules,
            store,
            renderer,
            header: HeaderName::try_from(config.header_name.as_str())?,
            in_flight: config.in_flight,
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            retry_after: HeaderValue::from(config.retry_after_secs),
        })
    }
}

impl<S> Layer<S> for IdempotencyLayer {
    type Service = IdempotencyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Executes each idempotency key at most once.
#[derive(Debug, Clone)]
pub struct IdempotencyService<S> {
    inner: S,
    layer: IdempotencyLayer,
}

impl<S> Service<Request<Body>> for IdempotencyService<S>
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

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !policy.idempotent {
            return Box::pin(inner.call(req));
        }

        let layer = self.layer.clone();
        Box::pin(async move {
            let path = req.uri().path().to_string();

            let key = match idempotency_key(&req, &layer.header) {
                Ok(key) => key,
                Err(error) => {
                    tracing::debug!(path = %path, header = %layer.header, error = %error, "Rejected idempotency key");
                    metrics::record_idempotency_event(match error {
                        GuardError::InvalidIdempotencyKey { .. } => "invalid",
                        _ => "missing",
                    });
                    return Ok(layer.renderer.render(&error, &path));
                }
            };

            let deadline = Instant::now() + layer.wait_timeout;
            loop {
                match layer.store.try_claim(&key) {
                    Claim::Replay(record) => {
                        tracing::debug!(key = %key, "Replaying stored response");
                        metrics::record_idempotency_event("replayed");
                        return Ok(record.to_response());
                    }
                    Claim::Pending(_) if layer.in_flight == InFlightPolicy::Reject => {
                        return Ok(in_progress(&layer, key, &path));
                    }
                    Claim::Pending(in_flight) => {
                        match tokio::time::timeout_at(deadline, in_flight.wait()).await {
                            Ok(Some(record)) => {
                                tracing::debug!(key = %key, "In-flight request finished, replaying");
                                metrics::record_idempotency_event("waited");
                                return Ok(record.to_response());
                            }
                            // Claim was released; try to take it.
                            Ok(None) => continue,
                            Err(_) => return Ok(in_progress(&layer, key, &path)),
                        }
                    }
                    Claim::Acquired => break,
                }
            }

            let guard = ClaimGuard::new(layer.store.clone(), key);
            let response = inner.call(req).await?;

            let buffered = match buffer_response(response).await {
                Ok(buffered) => buffered,
                Err(error) => {
                    tracing::warn!(key = %guard.key, error = %error, "Could not record response");
                    return Ok(layer.renderer.render(&error, &path));
                }
            };

            let record = IdempotencyRecord::from_response(guard.key.clone(), buffered);
            let record = guard.complete(record);
            tracing::debug!(key = %record.key, status = %record.status, "Stored idempotent response");
            metrics::record_idempotency_event("executed");
            Ok(record.to_response())
        })
    }
}

/// The key exactly as sent. Bytes that are not UTF-8 are refused rather than
/// replaced, so two distinct keys can never share a record.
fn idempotency_key<B>(req: &Request<B>, header: &HeaderName) -> Result<String, GuardError> {
    let value = req
        .headers()
        .get(header)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GuardError::MissingIdempotencyKey {
            header: header.to_string(),
        })?;
    std::str::from_utf8(value.as_bytes())
        .map(str::to_owned)
        .map_err(|_| GuardError::InvalidIdempotencyKey {
            header: header.to_string(),
        })
}

fn in_progress(layer: &IdempotencyLayer, key: String, path: &str) -> Response<Body> {
    tracing::info!(key = %key, "Idempotency key already in progress");
    metrics::record_idempotency_event("rejected");
    let error = GuardError::IdempotencyInProgress { key };
    let mut response = layer.renderer.render(&error, path);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, layer.retry_after.clone());
    response
}

/// Owns a claimed key until its record is stored.
struct ClaimGuard {
    store: Option<Arc<dyn IdempotencyStore>>,
    key: String,
}

impl ClaimGuard {
    fn new(store: Arc<dyn IdempotencyStore>, key: String) -> Self {
        Self {
            store: Some(store),
            key,
        }
    }

    fn complete(mut self, record: IdempotencyRecord) -> Arc<IdempotencyRecord> {
        match self.store.take() {
            Some(store) => store.complete(record),
            None => Arc::new(record),
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            tracing::debug!(key = %self.key, "Releasing idempotency claim");
            store.release(&self.key);
        }
    }
}
