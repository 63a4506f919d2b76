//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (count against the client's fixed window)
//!     → denied: 429 + Retry-After, downstream skipped
//! Outgoing 401 from the auth endpoint:
//!     → monitor.rs (failed-login tracking)
//! ```
//!
//! # Design Decisions
//! - Fail open: an unreachable counter store never blocks traffic
//! - Denials are values, keeping the hot path free of errors

pub mod monitor;
pub mod rate_limit;

pub use monitor::{FailedLoginMonitor, SecurityMonitor};
pub use rate_limit::{RateLimitDecision, RateLimitHeaders, RateLimitKey, RateLimiter};
