//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, guard layer stack)
//!     → request.rs (request ID generation and propagation)
//!     → guard layers / application handlers
//!     → problem.rs (guard errors rendered as problem+json)
//!     → Send to client
//! ```

pub mod problem;
pub mod request;
pub mod server;

pub use problem::{ProblemDetailsRenderer, ProblemRenderer, PROBLEM_JSON};
pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{build_router, AppState, HttpServer, ServerError};
