//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the guard components from configuration
//! - Wrap the application router in the guard layers
//! - Bind server to listener and shut down gracefully
//!
//! # Layer Order
//! ```text
//! TraceLayer → SetRequestId → PropagateRequestId → Timeout
//!     → CircuitBreaker → Idempotency → TrafficLogging → application
//! ```
//! `/health` is merged after the guard layers and bypasses them.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::header::InvalidHeaderName,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::GuardConfig;
use crate::http::problem::{ProblemDetailsRenderer, ProblemRenderer};
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::idempotency::{IdempotencyLayer, InMemoryIdempotencyStore};
use crate::lifecycle::{signals::shutdown_signal, Shutdown};
use crate::observability::{HttpLoggingHandler, LogSink, TracingSink, TrafficLoggingLayer};
use crate::resilience::{BreakerRegistry, CircuitBreakerLayer, InMemoryBreakerRegistry};
use crate::routing::{RouteRuleError, RouteRuleSet};

/// Errors raised while assembling the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid route rules: {0}")]
    Rules(#[from] RouteRuleError),

    #[error("Invalid idempotency header name: {0}")]
    HeaderName(#[from] InvalidHeaderName),
}

/// Shared guard components.
#[derive(Debug, Clone)]
pub struct AppState {
    pub rules: Arc<RouteRuleSet>,
    pub breakers: Arc<InMemoryBreakerRegistry>,
    pub store: Arc<InMemoryIdempotencyStore>,
    pub logging: Arc<HttpLoggingHandler>,
    pub renderer: Arc<dyn ProblemRenderer>,
}

impl AppState {
    /// Build every component from `config`; traffic records go to tracing.
    pub fn from_config(config: &GuardConfig) -> Result<Self, ServerError> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: &GuardConfig, sink: Arc<dyn LogSink>) -> Result<Self, ServerError> {
        let rules = RouteRuleSet::from_config(&config.defaults, &config.routes)?;
        tracing::debug!(rules = rules.rules().len(), "Route rules loaded");

        Ok(Self {
            rules: Arc::new(rules),
            breakers: Arc::new(InMemoryBreakerRegistry::new(config.circuit_breaker.clone())),
            store: Arc::new(InMemoryIdempotencyStore::with_ttl(
                config.idempotency.ttl_secs.map(Duration::from_secs),
            )),
            logging: Arc::new(HttpLoggingHandler::from_config(&config.logging, sink)),
            renderer: Arc::new(ProblemDetailsRenderer),
        })
    }
}

/// Wrap `app` in the guard layers and add `/health`.
#[allow(deprecated)]
pub fn build_router(config: &GuardConfig, state: &AppState, app: Router) -> Result<Router, ServerError> {
    let idempotency = IdempotencyLayer::new(
        state.rules.clone(),
        state.store.clone(),
        state.renderer.clone(),
        &config.idempotency,
    )?;
    let breaker = CircuitBreakerLayer::new(
        state.rules.clone(),
        state.breakers.clone(),
        state.renderer.clone(),
    )
    .record_server_errors(config.circuit_breaker.record_server_errors);

    let guarded = app.layer(
        ServiceBuilder::new()
            .layer(breaker)
            .layer(idempotency)
            .layer(TrafficLoggingLayer::new(state.logging.clone())),
    );

    let health = Router::new()
        .route("/health", get(health_handler))
        .with_state(state.breakers.clone());

    Ok(guarded.merge(health).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
            .layer(propagate_request_id_layer())
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs))),
    ))
}

/// Breaker states by name.
async fn health_handler(State(breakers): State<Arc<InMemoryBreakerRegistry>>) -> impl IntoResponse {
    let states: serde_json::Map<_, _> = breakers
        .states()
        .into_iter()
        .map(|(name, state)| (name, json!(state.to_string())))
        .collect();
    Json(json!({ "status": "UP", "breakers": states }))
}

/// HTTP server running an application behind the guard layers.
pub struct HttpServer {
    router: Router,
    state: AppState,
    config: GuardConfig,
    shutdown: Shutdown,
}

impl HttpServer {
    /// Create a new HTTP server for `app`.
    pub fn new(config: GuardConfig, app: Router) -> Result<Self, ServerError> {
        let state = AppState::from_config(&config)?;
        Self::with_state(config, state, app)
    }

    pub fn with_state(config: GuardConfig, state: AppState, app: Router) -> Result<Self, ServerError> {
        let router = build_router(&config, &state, app)?;
        Ok(Self {
            router,
            state,
            config,
            shutdown: Shutdown::new(),
        })
    }

    /// Handle that stops the server when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        if let Some(ttl) = self.config.idempotency.ttl_secs {
            spawn_purge_task(
                self.state.store.clone(),
                Duration::from_secs(ttl.max(1)),
                self.shutdown.clone(),
            );
        }

        let mut stop = self.shutdown.subscribe();
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => shutdown.trigger(),
                    _ = stop.recv() => {}
                }
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Periodically drop expired idempotency records until shutdown.
fn spawn_purge_task(store: Arc<InMemoryIdempotencyStore>, every: Duration, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "Purged expired idempotency records");
                    }
                }
                _ = stop.recv() => break,
            }
        }
    });
}
