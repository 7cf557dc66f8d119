//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the traffic guard.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Policy applied to requests no route rule matches.
    pub defaults: DefaultPolicyConfig,

    /// Ordered route rules. First match wins.
    pub routes: Vec<RouteRuleConfig>,

    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Idempotency cache settings.
    pub idempotency: IdempotencyConfig,

    /// Traffic logging and obfuscation.
    pub logging: LoggingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Policy for requests that match no route rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultPolicyConfig {
    /// Breaker consulted for unmatched requests.
    pub breaker_name: String,

    /// Whether unmatched requests pass through the breaker.
    pub protected_by_breaker: bool,

    /// Whether unmatched requests require an idempotency key.
    pub idempotent: bool,
}

impl Default for DefaultPolicyConfig {
    fn default() -> Self {
        Self {
            breaker_name: "default".to_string(),
            protected_by_breaker: true,
            idempotent: false,
        }
    }
}

/// One batch of route rules.
///
/// Every pattern in `patterns` becomes one rule; the modifier fields apply to
/// all of them. With `any_request` set the modifiers update the default policy
/// instead.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteRuleConfig {
    /// Apply the modifiers to the default policy.
    pub any_request: bool,

    /// Restrict the patterns to one HTTP method.
    pub method: Option<String>,

    /// Ant-style path patterns.
    pub patterns: Vec<String>,

    /// Exempt the batch from both the breaker and the idempotency cache.
    pub permit_all: bool,

    /// Breaker name for the batch.
    pub breaker_name: Option<String>,

    /// Override breaker protection.
    pub protected_by_breaker: Option<bool>,

    /// Override idempotency.
    pub idempotent: Option<bool>,
}

impl RouteRuleConfig {
    /// True if the entry carries at least one modifier.
    pub fn has_modifiers(&self) -> bool {
        self.permit_all
            || self.breaker_name.is_some()
            || self.protected_by_breaker.is_some()
            || self.idempotent.is_some()
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Record 5xx responses as failures.
    pub record_server_errors: bool,

    /// Settings for breakers without an explicit entry.
    pub defaults: BreakerSettings,

    /// Per-breaker overrides keyed by breaker name.
    pub instances: HashMap<String, BreakerSettings>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            record_server_errors: false,
            defaults: BreakerSettings::default(),
            instances: HashMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Settings for a named breaker.
    pub fn settings_for(&self, name: &str) -> &BreakerSettings {
        self.instances.get(name).unwrap_or(&self.defaults)
    }
}

/// Thresholds for a count-based breaker.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failure rate (percent) at which the breaker opens.
    pub failure_rate_threshold: f32,

    /// Number of most recent outcomes considered.
    pub sliding_window_size: usize,

    /// Outcomes required before the failure rate is evaluated.
    pub minimum_number_of_calls: usize,

    /// How long the breaker stays open before admitting trial calls, in milliseconds.
    pub wait_duration_in_open_state_ms: u64,

    /// Trial calls allowed while half-open.
    pub permitted_calls_in_half_open_state: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 100,
            minimum_number_of_calls: 10,
            wait_duration_in_open_state_ms: 60_000,
            permitted_calls_in_half_open_state: 10,
        }
    }
}

/// What to do with a request whose key is claimed by an in-flight request.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Wait for the first request's record, then replay it.
    #[default]
    Wait,
    /// Reject immediately and ask the client to retry.
    Reject,
}

/// Idempotency cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Header carrying the idempotency key.
    pub header_name: String,

    /// Handling of concurrent requests with the same key.
    pub in_flight: InFlightPolicy,

    /// Maximum wait for an in-flight record, in milliseconds.
    pub wait_timeout_ms: u64,

    /// Retry-After value sent with in-progress rejections, in seconds.
    pub retry_after_secs: u64,

    /// Record lifetime for the in-memory store. `None` keeps records forever.
    pub ttl_secs: Option<u64>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: "X-Idempotency-Key".to_string(),
            in_flight: InFlightPolicy::Wait,
            wait_timeout_ms: 10_000,
            retry_after_secs: 1,
            ttl_secs: None,
        }
    }
}

/// Traffic logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// HTTP traffic logging.
    pub http: HttpLoggingConfig,

    /// Masking applied before records are written.
    pub obfuscate: ObfuscateConfig,
}

/// Amount of detail written per exchange.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpLogLevel {
    /// Nothing is logged.
    None,
    /// Method, URI, status and duration.
    #[default]
    Basic,
    /// Basic plus headers.
    Headers,
    /// Headers plus bodies.
    Full,
}

/// Path rule used by the include/exclude filters.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PathRuleConfig {
    /// Ant-style path pattern.
    pub path_pattern: String,

    /// Methods the rule applies to. Empty means all methods.
    pub methods: Vec<String>,
}

/// HTTP traffic logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpLoggingConfig {
    /// Enable traffic logging.
    pub enabled: bool,

    /// Detail level.
    pub level: HttpLogLevel,

    /// Captured body bytes per direction. Larger bodies are truncated in the log only.
    pub max_body_bytes: usize,

    /// Pretty-print records.
    pub pretty: bool,

    /// Only matching requests are logged. Empty means all requests.
    pub include: Vec<PathRuleConfig>,

    /// Matching requests are never logged.
    pub exclude: Vec<PathRuleConfig>,
}

impl Default for HttpLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: HttpLogLevel::Basic,
            max_body_bytes: 64 * 1024, // 64KB
            pretty: false,
            include: Vec::new(),
            exclude: vec![PathRuleConfig {
                path_pattern: "/health".to_string(),
                methods: Vec::new(),
            }],
        }
    }
}

/// Obfuscation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObfuscateConfig {
    /// Disable to log values verbatim.
    pub enabled: bool,

    /// Replacement for masked values.
    pub mask_value: String,

    /// Header names to mask (case-insensitive).
    pub headers: Vec<String>,

    /// Query parameter names to mask (case-insensitive).
    pub parameters: Vec<String>,

    /// JSON body paths to mask, e.g. `$.password` or `$.items[*].secret`.
    pub json_body_fields: Vec<String>,
}

impl Default for ObfuscateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mask_value: "****".to_string(),
            headers: vec![
                "Authorization".to_string(),
                "Cookie".to_string(),
                "Set-Cookie".to_string(),
            ],
            parameters: vec!["access_token".to_string()],
            json_body_fields: vec!["$.password".to_string()],
        }
    }
}

/// Diagnostic log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Machine-readable JSON lines.
    Json,
    /// Human-readable output.
    #[default]
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Diagnostic log format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
