//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the guard.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Counter store connection settings.
    pub store: StoreConfig,

    /// Retry configuration for store operations.
    pub retries: RetryConfig,

    /// Circuit breaker guarding the counter store.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Adaptive diagnostic sampling.
    pub sampling: SamplingConfig,

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

/// Timeout configuration for inbound requests.
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

/// How the counter store is reached.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreTopology {
    /// In-process counters; only meaningful for a single instance.
    Memory,

    /// A single Redis node addressed by a `redis://` URL.
    ///
    /// TLS (`rediss://`) is not supported and is rejected at validation;
    /// terminate TLS in a local proxy if the store requires it.
    Redis { url: String },

    /// Primary discovered through Sentinel nodes.
    Sentinel {
        nodes: Vec<String>,
        master_name: String,
    },
}

impl Default for StoreTopology {
    fn default() -> Self {
        StoreTopology::Redis {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub topology: StoreTopology,

    /// Password for the data nodes (sentinel topology only; URLs carry their own).
    pub password: Option<String>,

    /// Logical database index (sentinel topology only).
    pub db: i64,

    /// Prefix applied to every rate limit key.
    pub key_prefix: String,

    /// Deadline for each connect, ping or command, in milliseconds.
    pub operation_timeout_ms: u64,

    /// Deadline for asking a single Sentinel node for the master, in
    /// milliseconds. Keep it below `operation_timeout_ms` so a hung node
    /// leaves time to ask the next one.
    pub sentinel_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            topology: StoreTopology::default(),
            password: None,
            db: 0,
            key_prefix: "rate_limit".to_string(),
            operation_timeout_ms: 1000,
            sentinel_timeout_ms: 250,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Cooldown before a trial request is let through, in seconds.
    pub reset_timeout_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_seconds: 60,
        }
    }
}

/// Limit applied to a single endpoint.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct EndpointLimitConfig {
    pub window_seconds: u64,
    pub max_requests: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Window length used when no endpoint override matches.
    pub default_window_seconds: u64,

    /// Requests allowed per window when no endpoint override matches.
    pub default_max_requests: u64,

    /// Per-endpoint overrides, keyed by route pattern as registered with the
    /// router (e.g. "/auth/login", "/items/{id}"). Requests that match no
    /// route are keyed by their literal path.
    pub endpoints: HashMap<String, EndpointLimitConfig>,

    /// Take the client identifier from `X-Forwarded-For` when present.
    pub trust_forwarded_for: bool,

    /// Path whose 401 responses are reported as failed logins.
    pub auth_endpoint: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_window_seconds: 60,
            default_max_requests: 100,
            endpoints: HashMap::new(),
            trust_forwarded_for: false,
            auth_endpoint: "/auth/login".to_string(),
        }
    }
}

/// Adaptive sampling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Requests slower than this count as slow.
    pub slow_request_threshold_ms: u64,

    /// Error ratio above which sampling is increased.
    pub error_rate_threshold: f64,

    /// Slow ratio above which sampling is increased.
    pub slow_rate_threshold: f64,

    /// Length of the evaluation window in seconds.
    pub sampling_window_seconds: u64,

    pub initial_trace_rate: f64,
    pub initial_profile_rate: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            slow_request_threshold_ms: 1000,
            error_rate_threshold: 0.05,
            slow_rate_threshold: 0.1,
            sampling_window_seconds: 60,
            initial_trace_rate: 1.0,
            initial_profile_rate: 1.0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
