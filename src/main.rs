//! overload-guard demo server.
//!
//! ```text
//!     Client ──▶ timeout/trace ──▶ enforcement ──▶ demo handlers
//!                                      │
//!                                      ├──▶ RateLimiter ──▶ ResilientStore ──▶ Redis / Sentinel / memory
//!                                      ├──▶ AdaptiveSampler
//!                                      └──▶ FailedLoginMonitor
//! ```
//!
//! Protects a tiny application (`/` echo, `/auth/login`) so the guard can be
//! exercised end to end against a real store.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::net::TcpListener;

use overload_guard::config::{load_config, GuardConfig};
use overload_guard::observability::{logging, metrics};
use overload_guard::{Guard, GuardServer, Shutdown};

#[derive(Parser)]
#[command(name = "overload-guard")]
#[command(about = "Rate limiting and adaptive sampling in front of an HTTP service", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GuardConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!("overload-guard v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        key_prefix = %config.store.key_prefix,
        rate_limit_enabled = config.rate_limit.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let guard = Guard::from_config(&config, Arc::new(metrics::PrometheusSink))?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();
    guard.spawn_background(&shutdown);

    let server = GuardServer::new(&config, guard, demo_app());
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn demo_app() -> Router {
    Router::new()
        .route("/", get(|| async { "hello" }))
        .route("/auth/login", post(login_handler))
}

async fn login_handler(headers: HeaderMap) -> StatusCode {
    if headers.contains_key(axum::http::header::AUTHORIZATION) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}
