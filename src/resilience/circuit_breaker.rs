//! Circuit breaker guarding the counter store.
//!
//! # States
//! - Closed: attempts pass through
//! - Open: attempts fail fast until the reset timeout has elapsed
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → (one trial request let through) after reset_timeout; opened_at re-armed
//! trial succeeds → Closed
//! trial fails → stays Open, opened_at re-armed
//! ```
//!
//! There is no tracked half-open state: the trial request is simply the one attempt
//! allowed per cooldown cycle.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug)]
struct CircuitState {
    failure_count: u32,
    opened_at: Option<Instant>,
    is_open: bool,
}

/// Point-in-time copy of the breaker for status reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub is_open: bool,
    pub failure_count: u32,
    pub threshold: u32,
    pub reset_timeout_secs: u64,
    /// Seconds until the next trial request is allowed, if open.
    pub trial_in_secs: Option<u64>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_timeout,
            state: Mutex::new(CircuitState {
                failure_count: 0,
                opened_at: None,
                is_open: false,
            }),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_secs(config.reset_timeout_seconds),
        )
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        state.failure_count = state.failure_count.saturating_add(1);
        if state.failure_count >= self.threshold {
            if !state.is_open {
                tracing::warn!(
                    failures = state.failure_count,
                    reset_timeout_secs = self.reset_timeout.as_secs(),
                    "Circuit opened"
                );
            }
            state.is_open = true;
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        if state.is_open {
            tracing::info!("Circuit closed after successful trial request");
        }
        state.failure_count = 0;
        state.is_open = false;
        state.opened_at = None;
    }

    /// Whether a new attempt may proceed.
    ///
    /// While open, exactly one caller per elapsed cooldown gets `true`.
    pub fn should_allow_request(&self) -> bool {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        if !state.is_open {
            return true;
        }

        let now = Instant::now();
        match state.opened_at {
            Some(opened_at) if now.duration_since(opened_at) < self.reset_timeout => false,
            _ => {
                state.opened_at = Some(now);
                tracing::debug!("Circuit cooldown elapsed, letting trial request through");
                true
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().expect("circuit breaker mutex poisoned").is_open
    }

    pub fn failure_count(&self) -> u32 {
        self.state
            .lock()
            .expect("circuit breaker mutex poisoned")
            .failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock().expect("circuit breaker mutex poisoned");
        let trial_in_secs = match (state.is_open, state.opened_at) {
            (true, Some(opened_at)) => Some(
                self.reset_timeout
                    .saturating_sub(opened_at.elapsed())
                    .as_secs(),
            ),
            _ => None,
        };
        CircuitSnapshot {
            is_open: state.is_open,
            failure_count: state.failure_count,
            threshold: self.threshold,
            reset_timeout_secs: self.reset_timeout.as_secs(),
            trial_in_secs,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_config(&CircuitBreakerConfig::default())
    }
}
