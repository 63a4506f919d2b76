//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Counter store call:
//!     → circuit_breaker.rs (fail fast while open)
//!     → store.rs (resolve endpoint, connect, ping, run op under timeout)
//!     → On failure: retries.rs (backoff + jitter, bounded attempts)
//!     → circuit_breaker.rs (record outcome)
//! ```
//!
//! # Design Decisions
//! - Every store call has a deadline; a timeout is a breaker failure
//! - Exhaustion surfaces `StoreError::Unavailable`, which callers absorb
//! - One breaker per `ResilientStore`, shared by all requests

pub mod circuit_breaker;
pub mod retries;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot};
pub use retries::RetryPolicy;
pub use store::{ConnectionHandle, ResilientStore};
