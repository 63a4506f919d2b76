//! Resilient access to the shared counter store.
//!
//! # Responsibilities
//! - Gate every attempt on the circuit breaker
//! - Resolve and cache the write endpoint, re-resolving after failures
//! - Bound connect/ping/command calls with the operation timeout
//! - Retry transient failures with backoff, surfacing `Unavailable` on exhaustion
//!
//! Failures here are meant to be absorbed upstream (the rate limiter fails
//! open); nothing in this module produces a user-facing error.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::config::GuardConfig;
use crate::observability::metrics::MetricsSink;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retries::RetryPolicy;
use crate::store::{CounterConnection, Endpoint, StoreBackend, StoreError, StoreResult};

/// A connection exclusively owned for one operation.
///
/// Dropping the handle releases it, whichever way the operation ended.
pub struct ConnectionHandle {
    conn: Box<dyn CounterConnection>,
    active: Arc<AtomicUsize>,
}

impl ConnectionHandle {
    fn new(conn: Box<dyn CounterConnection>, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self { conn, active }
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn CounterConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for ConnectionHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counter store access with breaker gating, retries and timeouts.
pub struct ResilientStore {
    backend: Arc<dyn StoreBackend>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    op_timeout: Duration,
    endpoint: Mutex<Option<Endpoint>>,
    active: Arc<AtomicUsize>,
    metrics: Arc<dyn MetricsSink>,
}

impl ResilientStore {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        op_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            backend,
            breaker,
            retry,
            op_timeout,
            endpoint: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
            metrics,
        }
    }

    pub fn from_config(
        config: &GuardConfig,
        backend: Arc<dyn StoreBackend>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self::new(
            backend,
            CircuitBreaker::from_config(&config.circuit_breaker),
            RetryPolicy::from_config(&config.retries),
            Duration::from_millis(config.store.operation_timeout_ms),
            metrics,
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Handles currently checked out.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn cached_endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().expect("endpoint cache mutex poisoned").clone()
    }

    fn invalidate_endpoint(&self) {
        self.endpoint.lock().expect("endpoint cache mutex poisoned").take();
        self.backend.invalidate();
    }

    async fn current_endpoint(&self) -> StoreResult<Endpoint> {
        let cached = self.cached_endpoint();
        if let Some(endpoint) = cached {
            return Ok(endpoint);
        }

        let endpoint = self.backend.resolve_endpoint().await?;
        tracing::info!(endpoint = %endpoint, "Resolved counter store endpoint");
        *self.endpoint.lock().expect("endpoint cache mutex poisoned") = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn connect_once(&self) -> StoreResult<ConnectionHandle> {
        let endpoint = self.current_endpoint().await?;
        let conn = self.backend.connect(&endpoint).await?;
        let mut handle = ConnectionHandle::new(conn, self.active.clone());
        handle.ping().await?;
        Ok(handle)
    }

    fn record_operation(&self, operation: &'static str, outcome: &'static str) {
        self.metrics.record(
            "store_operations_total",
            1.0,
            &[("operation", operation.to_string()), ("outcome", outcome.to_string())],
        );
    }

    /// Obtain a live, pinged connection.
    pub async fn get_connection(&self) -> StoreResult<ConnectionHandle> {
        let mut attempt = 0;
        loop {
            if !self.breaker.should_allow_request() {
                return Err(StoreError::Unavailable("circuit breaker open".to_string()));
            }
            attempt += 1;

            let result = match timeout(self.op_timeout, self.connect_once()).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            };

            match result {
                Ok(handle) => {
                    self.breaker.record_success();
                    return Ok(handle);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    self.invalidate_endpoint();

                    if !self.retry.has_attempts_left(attempt) {
                        tracing::warn!(attempts = attempt, error = %e, "Counter store connection retries exhausted");
                        return Err(StoreError::Unavailable(format!(
                            "connection failed after {} attempts: {}",
                            attempt, e
                        )));
                    }

                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(attempt, delay = ?delay, error = %e, "Retrying counter store connection");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Run `f` against a fresh connection, retrying transient failures.
    ///
    /// `f` takes ownership of the handle, so the connection is released as
    /// soon as its future completes, fails or is cancelled by the timeout.
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: Fn(ConnectionHandle) -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let handle = match self.get_connection().await {
                Ok(handle) => handle,
                Err(e) => {
                    self.record_operation(operation, "unavailable");
                    return Err(e);
                }
            };

            let result = match timeout(self.op_timeout, f(handle)).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            };

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    self.record_operation(operation, "success");
                    return Ok(value);
                }
                Err(StoreError::Unavailable(reason)) => {
                    self.record_operation(operation, "unavailable");
                    return Err(StoreError::Unavailable(reason));
                }
                Err(e) => {
                    self.breaker.record_failure();
                    self.invalidate_endpoint();
                    self.record_operation(operation, "failure");

                    if !self.retry.has_attempts_left(attempt) {
                        tracing::warn!(operation, attempts = attempt, error = %e, "Counter store operation retries exhausted");
                        return Err(StoreError::Unavailable(format!(
                            "{} failed after {} attempts: {}",
                            operation, attempt, e
                        )));
                    }

                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(operation, attempt, delay = ?delay, error = %e, "Retrying counter store operation");
                    sleep(delay).await;
                }
            }
        }
    }
}
