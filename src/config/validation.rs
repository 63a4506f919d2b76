//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and topology
//! consistency. `validate_config` reports every problem, not just the first.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{GuardConfig, StoreTopology};

/// Lowest and highest sampling rate the sampler will ever emit.
pub const MIN_SAMPLE_RATE: f64 = 0.01;
pub const MAX_SAMPLE_RATE: f64 = 1.0;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: String },

    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid address for {field}: {value}")]
    Address { field: String, value: String },

    #[error("invalid store url {url}: {reason}")]
    StoreUrl { url: String, reason: String },

    #[error("sentinel topology requires at least one node")]
    NoSentinelNodes,
}

fn require_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero {
            field: field.to_string(),
        });
    }
}

fn require_range(errors: &mut Vec<ValidationError>, field: &str, value: f64, min: f64, max: f64) {
    if !(min..=max).contains(&value) {
        errors.push(ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        });
    }
}

fn require_socket_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::Address {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    require_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    require_positive(&mut errors, "timeouts.request_secs", config.timeouts.request_secs);

    match &config.store.topology {
        StoreTopology::Memory => {}
        StoreTopology::Redis { url } => match url::Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "rediss" => errors.push(ValidationError::StoreUrl {
                url: url.clone(),
                reason: "TLS (rediss) is not supported, use redis://".to_string(),
            }),
            Ok(parsed) if parsed.scheme() != "redis" => errors.push(ValidationError::StoreUrl {
                url: url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            }),
            Ok(parsed) if parsed.host_str().is_none() => errors.push(ValidationError::StoreUrl {
                url: url.clone(),
                reason: "missing host".to_string(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::StoreUrl {
                url: url.clone(),
                reason: e.to_string(),
            }),
        },
        StoreTopology::Sentinel { nodes, .. } => {
            if nodes.is_empty() {
                errors.push(ValidationError::NoSentinelNodes);
            }
        }
    }
    require_positive(&mut errors, "store.operation_timeout_ms", config.store.operation_timeout_ms);
    require_positive(&mut errors, "store.sentinel_timeout_ms", config.store.sentinel_timeout_ms);

    require_positive(&mut errors, "retries.max_attempts", config.retries.max_attempts as u64);
    require_positive(
        &mut errors,
        "circuit_breaker.failure_threshold",
        config.circuit_breaker.failure_threshold as u64,
    );
    require_positive(
        &mut errors,
        "circuit_breaker.reset_timeout_seconds",
        config.circuit_breaker.reset_timeout_seconds,
    );

    let rl = &config.rate_limit;
    require_positive(&mut errors, "rate_limit.default_window_seconds", rl.default_window_seconds);
    require_positive(&mut errors, "rate_limit.default_max_requests", rl.default_max_requests);
    for (path, limit) in &rl.endpoints {
        require_positive(
            &mut errors,
            &format!("rate_limit.endpoints.{}.window_seconds", path),
            limit.window_seconds,
        );
        require_positive(
            &mut errors,
            &format!("rate_limit.endpoints.{}.max_requests", path),
            limit.max_requests,
        );
    }

    let s = &config.sampling;
    require_positive(&mut errors, "sampling.sampling_window_seconds", s.sampling_window_seconds);
    require_range(&mut errors, "sampling.error_rate_threshold", s.error_rate_threshold, 0.0, 1.0);
    require_range(&mut errors, "sampling.slow_rate_threshold", s.slow_rate_threshold, 0.0, 1.0);
    require_range(
        &mut errors,
        "sampling.initial_trace_rate",
        s.initial_trace_rate,
        MIN_SAMPLE_RATE,
        MAX_SAMPLE_RATE,
    );
    require_range(
        &mut errors,
        "sampling.initial_profile_rate",
        s.initial_profile_rate,
        MIN_SAMPLE_RATE,
        MAX_SAMPLE_RATE,
    );

    if config.observability.metrics_enabled {
        require_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
