//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and cross-field
//! consistency. All problems are collected, not just the first.

use std::net::SocketAddr;

use axum::http::HeaderName;
use thiserror::Error;

use crate::config::schema::{BreakerSettings, GuardConfig, PathRuleConfig};
use crate::routing::RouteRuleSet;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    if let Err(e) = RouteRuleSet::from_config(&config.defaults, &config.routes) {
        errors.push(ValidationError::new("routes", e.to_string()));
    }

    validate_breaker("circuit_breaker.defaults", &config.circuit_breaker.defaults, &mut errors);
    for (name, settings) in &config.circuit_breaker.instances {
        validate_breaker(&format!("circuit_breaker.instances.{}", name), settings, &mut errors);
    }

    if HeaderName::from_bytes(config.idempotency.header_name.as_bytes()).is_err() {
        errors.push(ValidationError::new(
            "idempotency.header_name",
            format!("'{}' is not a valid header name", config.idempotency.header_name),
        ));
    }

    if config.logging.obfuscate.mask_value.is_empty() {
        errors.push(ValidationError::new("logging.obfuscate.mask_value", "must not be empty"));
    }

    validate_path_rules("logging.http.include", &config.logging.http.include, &mut errors);
    validate_path_rules("logging.http.exclude", &config.logging.http.exclude, &mut errors);

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_breaker(field: &str, settings: &BreakerSettings, errors: &mut Vec<ValidationError>) {
    if !(settings.failure_rate_threshold > 0.0 && settings.failure_rate_threshold <= 100.0) {
        errors.push(ValidationError::new(
            format!("{}.failure_rate_threshold", field),
            "must be in (0, 100]",
        ));
    }
    if settings.sliding_window_size == 0 {
        errors.push(ValidationError::new(
            format!("{}.sliding_window_size", field),
            "must be greater than 0",
        ));
    }
    if settings.minimum_number_of_calls == 0 {
        errors.push(ValidationError::new(
            format!("{}.minimum_number_of_calls", field),
            "must be greater than 0",
        ));
    }
    if settings.permitted_calls_in_half_open_state == 0 {
        errors.push(ValidationError::new(
            format!("{}.permitted_calls_in_half_open_state", field),
            "must be greater than 0",
        ));
    }
}

fn validate_path_rules(field: &str, rules: &[PathRuleConfig], errors: &mut Vec<ValidationError>) {
    for (i, rule) in rules.iter().enumerate() {
        if !rule.path_pattern.starts_with('/') {
            errors.push(ValidationError::new(
                format!("{}[{}].path_pattern", field, i),
                "must start with '/'",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteRuleConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GuardConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = GuardConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.timeouts.request_secs = 0;
        config.logging.obfuscate.mask_value.clear();
        config.circuit_breaker.defaults.sliding_window_size = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"timeouts.request_secs"));
        assert!(fields.contains(&"logging.obfuscate.mask_value"));
        assert!(fields.contains(&"circuit_breaker.defaults.sliding_window_size"));
    }

    #[test]
    fn test_route_misuse_is_reported() {
        let mut config = GuardConfig::default();
        config.routes.push(RouteRuleConfig {
            idempotent: Some(true),
            ..Default::default()
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "routes");
    }
}
