//! Traffic-control and resilience layer for HTTP services.
//!
//! Per-client fixed-window rate limiting against a shared counter store,
//! guarded by retries and a circuit breaker so a store outage fails open,
//! plus adaptive trace/profile sampling driven by observed error and latency
//! ratios.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::schema::GuardConfig;
pub use http::GuardServer;
pub use lifecycle::{Guard, Shutdown};
