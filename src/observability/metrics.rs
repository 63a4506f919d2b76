//! Metrics collection and exposition.
//!
//! Components record through the [`MetricsSink`] capability so that the
//! guard never depends on a particular exporter. [`PrometheusSink`] forwards
//! to the `metrics` facade, exposed by `metrics-exporter-prometheus`.
//!
//! # Metrics
//! - `rate_limit_exceeded_total` (counter): denials by endpoint
//! - `rate_limit_remaining` (gauge): remaining budget after the last check
//! - `rate_limit_fail_open_total` (counter): decisions made without the store
//! - `store_operations_total` (counter): store calls by operation and outcome
//! - `request_duration_seconds` (histogram): handler latency
//! - `requests_total` (counter): requests by method, endpoint and status
//! - `failed_login_attempts_total` (counter): 401s from the auth endpoint
//! - `sampling_trace_rate` / `sampling_profile_rate` (gauges)
//!
//! Names ending in `_total` are counters, names ending in `_seconds` are
//! histograms, everything else is a gauge.

use std::net::SocketAddr;
use std::sync::Mutex;

use metrics::Label;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Label set attached to a single measurement.
pub type Labels<'a> = &'a [(&'static str, String)];

/// Minimal metrics-recording capability consumed by the core.
pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &'static str, value: f64, labels: Labels<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn for_name(name: &str) -> Self {
        if name.ends_with("_total") {
            MetricKind::Counter
        } else if name.ends_with("_seconds") {
            MetricKind::Histogram
        } else {
            MetricKind::Gauge
        }
    }
}

/// Sink backed by the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn record(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(key, value)| Label::new(*key, value.clone()))
            .collect();

        match MetricKind::for_name(name) {
            MetricKind::Counter => metrics::counter!(name, labels).increment(value.max(0.0) as u64),
            MetricKind::Histogram => metrics::histogram!(name, labels).record(value),
            MetricKind::Gauge => metrics::gauge!(name, labels).set(value),
        }
    }
}

/// Sink that drops every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _name: &'static str, _value: f64, _labels: Labels<'_>) {}
}

/// One captured measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub name: &'static str,
    pub value: f64,
    pub labels: Vec<(&'static str, String)>,
}

/// Sink that keeps every measurement in memory; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Recorded> {
        self.entries.lock().expect("recording sink mutex poisoned").clone()
    }

    /// All measurements recorded under `name`.
    pub fn named(&self, name: &str) -> Vec<Recorded> {
        self.entries()
            .into_iter()
            .filter(|r| r.name == name)
            .collect()
    }

    /// Sum of every value recorded under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.named(name).iter().map(|r| r.value).sum()
    }
}

impl MetricsSink for RecordingSink {
    fn record(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        self.entries
            .lock()
            .expect("recording sink mutex poisoned")
            .push(Recorded {
                name,
                value,
                labels: labels.to_vec(),
            });
    }
}

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}
