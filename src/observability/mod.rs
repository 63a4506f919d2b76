//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! EnforcementMiddleware (per finished request)
//!     → sampling.rs (error / slow ratios → trace & profile rates)
//!     → metrics.rs (MetricsSink: counters, gauges, histograms)
//! All subsystems:
//!     → logging.rs (structured tracing events)
//! ```
//!
//! # Design Decisions
//! - The core only needs `record(name, value, labels)`; exporters are swappable
//! - Sampling is a cheap multiplicative loop evaluated per request, bounded
//!   to `[0.01, 1.0]` so diagnostics never go fully dark or run away

pub mod logging;
pub mod metrics;
pub mod sampling;

pub use metrics::{MetricsSink, NoopSink, PrometheusSink, RecordingSink};
pub use sampling::{AdaptiveSampler, SampleRates, SamplingDecision};
