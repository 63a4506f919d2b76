//! Failed-login monitoring.
//!
//! The enforcement middleware reports every 401 from the authentication
//! endpoint here. The default monitor counts attempts per identifier inside
//! a sliding observation window and raises a warning once a client crosses
//! the alert threshold.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::observability::metrics::MetricsSink;

/// Security-monitoring capability consumed by the middleware.
pub trait SecurityMonitor: Send + Sync {
    fn record_failed_login(&self, identifier: &str);

    /// Drop state that no longer affects decisions. Returns how many
    /// entries were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Periodically purge `monitor` until shutdown.
pub async fn run_sweeper(
    monitor: Arc<dyn SecurityMonitor>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = monitor.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Purged expired login attempts");
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Login monitor sweeper stopping");
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    first_seen: Instant,
}

/// Counts failed logins and exports them as metrics.
pub struct FailedLoginMonitor {
    metrics: Arc<dyn MetricsSink>,
    attempts: DashMap<String, Attempts>,
    window: Duration,
    alert_threshold: u32,
}

impl FailedLoginMonitor {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
    pub const DEFAULT_ALERT_THRESHOLD: u32 = 5;

    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self::with_policy(metrics, Self::DEFAULT_WINDOW, Self::DEFAULT_ALERT_THRESHOLD)
    }

    pub fn with_policy(metrics: Arc<dyn MetricsSink>, window: Duration, alert_threshold: u32) -> Self {
        Self {
            metrics,
            attempts: DashMap::new(),
            window,
            alert_threshold: alert_threshold.max(1),
        }
    }

    /// Failed attempts currently attributed to `identifier`.
    pub fn attempts(&self, identifier: &str) -> u32 {
        let now = Instant::now();
        self.attempts
            .get(identifier)
            .filter(|a| now.duration_since(a.first_seen) < self.window)
            .map_or(0, |a| a.count)
    }

    /// Identifiers currently tracked, expired or not.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}

impl SecurityMonitor for FailedLoginMonitor {
    fn record_failed_login(&self, identifier: &str) {
        let now = Instant::now();
        let count = {
            let mut entry = self.attempts.entry(identifier.to_string()).or_insert(Attempts {
                count: 0,
                first_seen: now,
            });
            if now.duration_since(entry.first_seen) >= self.window {
                *entry = Attempts {
                    count: 0,
                    first_seen: now,
                };
            }
            entry.count += 1;
            entry.count
        };

        self.metrics.record("failed_login_attempts_total", 1.0, &[]);

        if count == self.alert_threshold {
            tracing::warn!(
                client = %identifier,
                attempts = count,
                window_secs = self.window.as_secs(),
                "Repeated failed logins"
            );
        } else {
            tracing::debug!(client = %identifier, attempts = count, "Failed login");
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.attempts.len();
        self.attempts
            .retain(|_, a| now.duration_since(a.first_seen) < self.window);
        before.saturating_sub(self.attempts.len())
    }
}
