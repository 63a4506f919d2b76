//! Counter store subsystem.
//!
//! # Data Flow
//! ```text
//! resilience::store::ResilientStore
//!     → StoreBackend::resolve_endpoint (direct URL or Sentinel discovery)
//!     → StoreBackend::connect(endpoint)
//!     → CounterConnection (GET / SET EX / INCR / EXPIRE / TTL / script)
//! ```
//!
//! # Design Decisions
//! - Backends only report failures; retry and breaker policy live in `resilience`
//! - `incr_with_expiry` is a single atomic step so concurrent first requests
//!   for a key can never both open a window

pub mod memory;
pub mod redis_store;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryBackend;
pub use self::redis_store::RedisBackend;

/// Errors produced by counter store access.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Breaker open or retries exhausted.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// A single call failed (network, protocol or timeout).
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Transient("operation timed out".to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The node currently accepting writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A live connection to the counter store.
///
/// The methods mirror the Redis commands a guard deployment relies on
/// (`PING`, `GET`, `TTL`, `SET EX`, `INCR`, `EXPIRE`). The rate limiter
/// itself only needs `ping` and `incr_with_expiry`; the plain commands are
/// there for operators inspecting or seeding counters by hand and for
/// alternative limiters built on the same store.
///
/// TTL values follow Redis conventions: `-2` for a missing key and `-1`
/// for a key without expiry.
#[async_trait]
pub trait CounterConnection: Send {
    /// Liveness check.
    async fn ping(&mut self) -> StoreResult<()>;

    async fn get(&mut self, key: &str) -> StoreResult<Option<u64>>;

    async fn ttl(&mut self, key: &str) -> StoreResult<i64>;

    async fn set_with_expiry(&mut self, key: &str, value: u64, seconds: u64) -> StoreResult<()>;

    async fn incr(&mut self, key: &str) -> StoreResult<u64>;

    async fn expire(&mut self, key: &str, seconds: u64) -> StoreResult<()>;

    /// Increment `key`, giving it a `seconds` expiry if this increment created
    /// it (or it has lost its expiry). Returns the new count and remaining TTL.
    async fn incr_with_expiry(&mut self, key: &str, seconds: u64) -> StoreResult<(u64, i64)>;
}

/// Source of connections to the counter store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Resolve the endpoint that currently accepts writes.
    async fn resolve_endpoint(&self) -> StoreResult<Endpoint>;

    /// Open a connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Box<dyn CounterConnection>>;

    /// Forget cached connections after a failure so the next `connect`
    /// starts fresh.
    fn invalidate(&self) {}
}
