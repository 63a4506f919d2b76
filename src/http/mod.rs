//! HTTP integration subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, timeout + trace layers)
//!     → middleware/enforcement.rs (rate limit, sampling, metrics, login monitoring)
//!     → protected application handlers
//! ```

pub mod middleware;
pub mod server;

pub use middleware::enforcement::{
    client_identifier, enforcement_middleware, EnforcementSettings, EnforcementState,
};
pub use server::GuardServer;
