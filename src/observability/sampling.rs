//! Adaptive diagnostic sampling.
//!
//! A rolling-window control loop over the trace and profile sampling
//! rates. At each window boundary the error and slow-request ratios of the
//! closed window decide the next rates:
//!
//! ```text
//! error_rate > error_threshold  or  slow_rate > slow_threshold  → double both (cap 1.0)
//! error_rate < error_threshold/10  and  slow_rate < slow_threshold/10 → halve both (floor 0.01)
//! otherwise → unchanged
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::validation::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
use crate::config::SamplingConfig;
use crate::observability::metrics::MetricsSink;

/// Current trace and profile sampling rates, each in `[0.01, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleRates {
    pub trace: f64,
    pub profile: f64,
}

/// Per-request sampling outcome, attached to the request as an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplingDecision {
    pub trace: bool,
    pub profile: bool,
}

/// Counters of the window currently being observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    pub request_count: u64,
    pub error_count: u64,
    pub slow_count: u64,
}

#[derive(Debug)]
struct SampleMetricsWindow {
    window_start: Instant,
    counts: WindowCounts,
    rates: SampleRates,
}

fn clamp_rate(rate: f64) -> f64 {
    rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE)
}

/// Sampler thresholds.
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    pub slow_threshold: Duration,
    pub error_rate_threshold: f64,
    pub slow_rate_threshold: f64,
    pub window: Duration,
}

impl SamplerSettings {
    fn next_rates(&self, counts: WindowCounts, rates: SampleRates) -> SampleRates {
        if counts.request_count == 0 {
            return rates;
        }

        let total = counts.request_count as f64;
        let error_rate = counts.error_count as f64 / total;
        let slow_rate = counts.slow_count as f64 / total;

        if error_rate > self.error_rate_threshold || slow_rate > self.slow_rate_threshold {
            SampleRates {
                trace: clamp_rate(rates.trace * 2.0),
                profile: clamp_rate(rates.profile * 2.0),
            }
        } else if error_rate < self.error_rate_threshold / 10.0
            && slow_rate < self.slow_rate_threshold / 10.0
        {
            SampleRates {
                trace: clamp_rate(rates.trace / 2.0),
                profile: clamp_rate(rates.profile / 2.0),
            }
        } else {
            rates
        }
    }
}

/// Adjusts sampling rates from observed error and latency ratios.
pub struct AdaptiveSampler {
    settings: SamplerSettings,
    state: Mutex<SampleMetricsWindow>,
    metrics: Arc<dyn MetricsSink>,
}

impl AdaptiveSampler {
    pub fn new(settings: SamplerSettings, initial: SampleRates, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            settings,
            state: Mutex::new(SampleMetricsWindow {
                window_start: Instant::now(),
                counts: WindowCounts {
                    request_count: 0,
                    error_count: 0,
                    slow_count: 0,
                },
                rates: SampleRates {
                    trace: clamp_rate(initial.trace),
                    profile: clamp_rate(initial.profile),
                },
            }),
            metrics,
        }
    }

    pub fn from_config(config: &SamplingConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self::new(
            SamplerSettings {
                slow_threshold: Duration::from_millis(config.slow_request_threshold_ms),
                error_rate_threshold: config.error_rate_threshold,
                slow_rate_threshold: config.slow_rate_threshold,
                window: Duration::from_secs(config.sampling_window_seconds),
            },
            SampleRates {
                trace: config.initial_trace_rate,
                profile: config.initial_profile_rate,
            },
            metrics,
        )
    }

    /// Account for one finished request.
    ///
    /// Crossing a window boundary first closes the previous window (rates
    /// recomputed, counters reset) and then counts this request in the new one.
    pub fn record_request(&self, duration: Duration, had_error: bool) {
        let now = Instant::now();
        let changed = {
            let mut state = self.state.lock().expect("sampler mutex poisoned");
            let mut changed = None;

            if now.duration_since(state.window_start) > self.settings.window {
                let previous = state.rates;
                let closed = state.counts;
                state.rates = self.settings.next_rates(closed, previous);
                if state.rates != previous {
                    changed = Some((previous, state.rates, closed));
                }
                state.counts = WindowCounts {
                    request_count: 0,
                    error_count: 0,
                    slow_count: 0,
                };
                state.window_start = now;
            }

            state.counts.request_count += 1;
            if had_error {
                state.counts.error_count += 1;
            }
            if duration > self.settings.slow_threshold {
                state.counts.slow_count += 1;
            }
            changed
        };

        if let Some((previous, current, closed)) = changed {
            tracing::info!(
                trace_rate = current.trace,
                profile_rate = current.profile,
                previous_trace_rate = previous.trace,
                requests = closed.request_count,
                errors = closed.error_count,
                slow = closed.slow_count,
                "Sampling rates adjusted"
            );
            self.metrics.record("sampling_trace_rate", current.trace, &[]);
            self.metrics.record("sampling_profile_rate", current.profile, &[]);
        }
    }

    pub fn get_current_sample_rates(&self) -> SampleRates {
        self.state.lock().expect("sampler mutex poisoned").rates
    }

    pub fn window_counts(&self) -> WindowCounts {
        self.state.lock().expect("sampler mutex poisoned").counts
    }

    /// Draw a sampling decision for one request from the current rates.
    pub fn decide(&self) -> SamplingDecision {
        let rates = self.get_current_sample_rates();
        SamplingDecision {
            trace: fastrand::f64() < rates.trace,
            profile: fastrand::f64() < rates.profile,
        }
    }
}
