//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GuardConfig (validated, immutable)
//!     → lifecycle::startup builds every component from it
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Invalid thresholds or windows are rejected at startup, never at request time

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CircuitBreakerConfig, EndpointLimitConfig, GuardConfig, ListenerConfig, ObservabilityConfig,
    RateLimitConfig, RetryConfig, SamplingConfig, StoreConfig, StoreTopology, TimeoutConfig,
};
