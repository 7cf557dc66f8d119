//! Traffic guard: circuit breaking, idempotency and traffic logging for axum services.

pub mod config;
pub mod error;
pub mod http;
pub mod idempotency;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod routing;

pub use config::schema::GuardConfig;
pub use error::GuardError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use routing::{RoutePolicy, RouteRuleSet};
