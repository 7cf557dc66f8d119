//! Traffic guard demo server.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────┐
//!                      │                  TRAFFIC GUARD                    │
//!   Client Request     │  ┌─────────┐  ┌─────────┐  ┌─────────────┐       │
//!   ───────────────────┼─▶│ request │─▶│ circuit │─▶│ idempotency │─┐     │
//!                      │  │ id/trace│  │ breaker │  │    cache    │ │     │
//!                      │  └─────────┘  └─────────┘  └─────────────┘ │     │
//!                      │                                            ▼     │
//!   Client Response    │  ┌──────────────────┐              ┌──────────┐  │
//!   ◀──────────────────┼──│ traffic logging  │◀─────────────│ handlers │  │
//!                      │  │ (mask + format)  │              └────┬─────┘  │
//!                      │  └──────────────────┘                   │        │
//!                      │          ▲        LoggingClient (outbound)        │
//!                      │          └──────────────────────────────┘        │
//!                      └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use traffic_guard::config::{load_config, GuardConfig};
use traffic_guard::http::{AppState, HttpServer};
use traffic_guard::observability::{self, LoggingClient};

#[derive(Parser)]
#[command(name = "traffic-guard")]
#[command(about = "Circuit breaking, idempotency and traffic logging in front of axum handlers", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct DemoState {
    orders: Arc<AtomicU64>,
    client: LoggingClient,
}

#[derive(Deserialize)]
struct FetchParams {
    url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GuardConfig::default(),
    };

    observability::logging::init(&config.observability)?;
    tracing::info!("traffic-guard v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => observability::metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let state = AppState::from_config(&config)?;
    let demo = DemoState {
        orders: Arc::new(AtomicU64::new(0)),
        client: LoggingClient::new(state.logging.clone()),
    };
    let app = Router::new()
        .route("/api/echo", post(echo))
        .route("/api/orders", post(create_order))
        .route("/api/fetch", get(fetch))
        .with_state(demo);

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::with_state(config, state, app)?;
    server.run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn echo(body: Bytes) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], body)
}

async fn create_order(State(demo): State<DemoState>, Json(order): Json<serde_json::Value>) -> impl IntoResponse {
    let id = demo.orders.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::CREATED, Json(json!({ "id": id, "order": order })))
}

/// Call `url` through the logging client and relay the answer.
async fn fetch(State(demo): State<DemoState>, Query(params): Query<FetchParams>) -> Response {
    let request = match Request::get(params.url.as_str()).body(Body::empty()) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match demo.client.request(request).await {
        Ok(response) => response.into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}
