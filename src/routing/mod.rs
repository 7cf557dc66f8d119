//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Rule Compilation (at startup):
//!     RouteRuleConfig[] or typed builder calls
//!     → rules.rs (matcher batches + modifiers)
//!     → matcher.rs (compile Ant patterns)
//!     → Freeze as immutable RouteRuleSet
//!
//! Incoming Request (method, path)
//!     → RouteRuleSet::resolve
//!     → RoutePolicy {breaker name, protected, idempotent}
//!     → stored in request extensions for the gates
//! ```
//!
//! # Design Decisions
//! - Rules compiled at startup, immutable at runtime
//! - Deterministic: same input always resolves to the same policy
//! - First match wins (registration order)

pub mod matcher;
pub mod rules;

pub use matcher::{PathPattern, PatternMatcher, RequestMatcher};
pub use rules::{
    MatcherBatch, RoutePolicy, RouteRule, RouteRuleError, RouteRuleSet, RouteRuleSetBuilder,
    DEFAULT_BREAKER_NAME,
};
