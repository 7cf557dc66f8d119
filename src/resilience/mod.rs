//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request (RoutePolicy resolved from RouteRuleSet):
//!     → gate.rs (skip if unprotected, else ask for permission)
//!     → circuit_breaker.rs (named breaker from the registry)
//!     → downstream call, outcome + elapsed time recorded
//!     → rejection rendered by the ProblemRenderer
//! ```
//!
//! # Design Decisions
//! - The breaker primitive sits behind a trait; the gate only speaks the protocol
//! - Breakers are shared per name across all concurrent requests
//! - No retries here; callers layer them above the allow/deny signal

pub mod circuit_breaker;
pub mod gate;

pub use circuit_breaker::{
    BreakerRegistry, BreakerState, CircuitBreaker, CountBasedBreaker, InMemoryBreakerRegistry,
};
pub use gate::{CircuitBreakerLayer, CircuitBreakerService};
