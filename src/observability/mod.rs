//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound (layer.rs) / outbound (client.rs) exchange:
//!     → capture.rs (tee bodies into bounded buffers)
//!     → http_logging.rs (filter, level gating, body policy)
//!     → obfuscation.rs (mask headers, query params, JSON fields)
//!     → formatter.rs (structured JSON record)
//!     → LogSink (tracing `traffic` target by default)
//!
//! Diagnostics:
//!     → logging.rs (tracing subscriber)
//!     → metrics.rs (counters, histograms, Prometheus endpoint)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows into every traffic record
//! - Logging never breaks traffic

pub mod capture;
pub mod client;
pub mod formatter;
pub mod http_logging;
pub mod layer;
pub mod logging;
pub mod metrics;
pub mod obfuscation;

pub use capture::{CapturedExchange, Direction, Source};
pub use client::LoggingClient;
pub use formatter::{HttpLog, JsonLogFormatter, LogFormatter};
pub use http_logging::{HttpLoggingHandler, LogSink, MemorySink, TracingSink};
pub use layer::TrafficLoggingLayer;
pub use obfuscation::{DefaultObfuscator, NoOpObfuscator, Obfuscator};
