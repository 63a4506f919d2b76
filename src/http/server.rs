//! HTTP server setup.
//!
//! # Responsibilities
//! - Wrap the protected application with the enforcement middleware
//! - Serve the guard's own `/health` and `/_guard/status` routes, unlimited
//! - Wire up request timeout and tracing layers
//! - Run until the shutdown signal fires

use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::GuardConfig;
use crate::lifecycle::startup::{Guard, GuardStatus};

/// HTTP server hosting a protected application.
pub struct GuardServer {
    router: Router,
    guard: Guard,
}

impl GuardServer {
    /// Protect `app` with the guard's middleware.
    pub fn new(config: &GuardConfig, guard: Guard, app: Router) -> Self {
        let router = Self::build_router(config, &guard, app);
        Self { router, guard }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &GuardConfig, guard: &Guard, app: Router) -> Router {
        let protected = guard.enforcement_state().protect(app);

        Router::new()
            .route("/health", get(health_handler))
            .route("/_guard/status", get(status_handler))
            .with_state(guard.clone())
            .merge(protected)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(TraceLayer::new_for_http())
    }

    /// The fully layered router, for in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(guard): State<Guard>) -> Json<GuardStatus> {
    Json(guard.status())
}
