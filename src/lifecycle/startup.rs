//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration (invalid thresholds or windows are fatal here)
//! - Build the store backend, resilient store, limiter, sampler and monitor
//!   explicitly, in dependency order, and hand them out by `Arc`
//! - Start background tasks (memory store and login monitor sweepers)

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::validation::{validate_config, ValidationError};
use crate::config::{ConfigError, GuardConfig};
use crate::http::middleware::enforcement::{EnforcementSettings, EnforcementState};
use crate::lifecycle::shutdown::Shutdown;
use crate::observability::metrics::MetricsSink;
use crate::observability::sampling::{AdaptiveSampler, SampleRates};
use crate::resilience::{CircuitSnapshot, ResilientStore};
use crate::security::monitor::{self, FailedLoginMonitor, SecurityMonitor};
use crate::security::rate_limit::RateLimiter;
use crate::store::{MemoryBackend, RedisBackend, StoreBackend};

const LOGIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot served by `/_guard/status`.
#[derive(Debug, Clone, Serialize)]
pub struct GuardStatus {
    pub circuit: CircuitSnapshot,
    pub sample_rates: SampleRates,
    pub store_endpoint: Option<String>,
    pub active_store_connections: usize,
}

/// All guard components, constructed once at startup.
#[derive(Clone)]
pub struct Guard {
    store: Arc<ResilientStore>,
    state: EnforcementState,
    memory: Option<MemoryBackend>,
    sweep_interval: Duration,
}

impl Guard {
    /// Validate `config` and build every component from it.
    pub fn from_config(config: &GuardConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self, ConfigError> {
        validate_config(config).map_err(ConfigError::Validation)?;

        let redis = RedisBackend::from_config(&config.store).map_err(|e| {
            ConfigError::Validation(vec![ValidationError::StoreUrl {
                url: format!("{:?}", config.store.topology),
                reason: e.to_string(),
            }])
        })?;

        let mut memory = None;
        let backend: Arc<dyn StoreBackend> = match redis {
            Some(redis) => Arc::new(redis),
            None => {
                let backend = MemoryBackend::new();
                memory = Some(backend.clone());
                Arc::new(backend)
            }
        };

        let mut guard = Self::with_backend(config, backend, metrics);
        guard.memory = memory;
        Ok(guard)
    }

    /// Build components around an already constructed backend.
    pub fn with_backend(
        config: &GuardConfig,
        backend: Arc<dyn StoreBackend>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let store = Arc::new(ResilientStore::from_config(config, backend, metrics.clone()));
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            &config.rate_limit,
            config.store.key_prefix.clone(),
            metrics.clone(),
        ));
        let sampler = Arc::new(AdaptiveSampler::from_config(&config.sampling, metrics.clone()));
        let security: Arc<dyn SecurityMonitor> = Arc::new(FailedLoginMonitor::new(metrics.clone()));

        tracing::info!(
            default_max_requests = config.rate_limit.default_max_requests,
            default_window_seconds = config.rate_limit.default_window_seconds,
            endpoint_overrides = config.rate_limit.endpoints.len(),
            failure_threshold = config.circuit_breaker.failure_threshold,
            "Guard components initialized"
        );

        Self {
            store,
            state: EnforcementState {
                limiter,
                sampler,
                metrics,
                security,
                settings: Arc::new(EnforcementSettings::from(&config.rate_limit)),
            },
            memory: None,
            sweep_interval: Duration::from_secs(config.rate_limit.default_window_seconds.max(1)),
        }
    }

    /// Replace the failed-login monitor.
    pub fn with_security_monitor(mut self, security: Arc<dyn SecurityMonitor>) -> Self {
        self.state.security = security;
        self
    }

    pub fn enforcement_state(&self) -> EnforcementState {
        self.state.clone()
    }

    pub fn store(&self) -> &Arc<ResilientStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.state.limiter
    }

    pub fn sampler(&self) -> &Arc<AdaptiveSampler> {
        &self.state.sampler
    }

    pub fn status(&self) -> GuardStatus {
        GuardStatus {
            circuit: self.store.breaker().snapshot(),
            sample_rates: self.state.sampler.get_current_sample_rates(),
            store_endpoint: self.store.cached_endpoint().map(|e| e.to_string()),
            active_store_connections: self.store.active_connections(),
        }
    }

    /// Spawn background maintenance tasks tied to `shutdown`.
    pub fn spawn_background(&self, shutdown: &Shutdown) {
        if let Some(memory) = self.memory.clone() {
            let interval = self.sweep_interval;
            let receiver = shutdown.subscribe();
            tokio::spawn(async move {
                memory.run_sweeper(interval, receiver).await;
            });
            tracing::info!(interval_secs = interval.as_secs(), "Memory store sweeper started");
        }

        tokio::spawn(monitor::run_sweeper(
            self.state.security.clone(),
            LOGIN_SWEEP_INTERVAL,
            shutdown.subscribe(),
        ));
    }
}
