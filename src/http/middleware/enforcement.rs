//! Enforcement middleware.
//!
//! Per request:
//! 1. Count the request against the client's window for this path
//! 2. Denied: answer 429 with the rate headers, skip the handler
//! 3. Allowed: draw a sampling decision, run the handler, feed duration and
//!    outcome to the sampler and the metrics sink
//! 4. Report 401s from the auth endpoint as failed logins
//! 5. Attach rate headers to allowed responses too

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};

use crate::config::RateLimitConfig;
use crate::observability::metrics::MetricsSink;
use crate::observability::sampling::AdaptiveSampler;
use crate::security::monitor::SecurityMonitor;
use crate::security::rate_limit::RateLimiter;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Metric label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "other";

/// Request-independent middleware settings.
#[derive(Debug, Clone)]
pub struct EnforcementSettings {
    pub enabled: bool,
    pub trust_forwarded_for: bool,
    pub auth_endpoint: String,
}

impl From<&RateLimitConfig> for EnforcementSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            trust_forwarded_for: config.trust_forwarded_for,
            auth_endpoint: config.auth_endpoint.clone(),
        }
    }
}

/// Everything the middleware needs, shared across requests.
#[derive(Clone)]
pub struct EnforcementState {
    pub limiter: Arc<RateLimiter>,
    pub sampler: Arc<AdaptiveSampler>,
    pub metrics: Arc<dyn MetricsSink>,
    pub security: Arc<dyn SecurityMonitor>,
    pub settings: Arc<EnforcementSettings>,
}

impl EnforcementState {
    /// Wrap every route of `router` with the enforcement middleware.
    pub fn protect(self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, enforcement_middleware))
    }
}

/// Identify the client: trusted `X-Forwarded-For`, then peer address.
pub fn client_identifier<B>(request: &Request<B>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Route pattern the request matched (`/items/{id}`), if any.
fn matched_route<B>(request: &Request<B>) -> Option<String> {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
}

pub async fn enforcement_middleware(
    State(state): State<EnforcementState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let identifier = client_identifier(&request, state.settings.trust_forwarded_for);
    let path = request.uri().path().to_string();
    let route = matched_route(&request);
    // Limit by route pattern so path parameters share one window.
    let endpoint = route.clone().unwrap_or_else(|| path.clone());
    let route_label = route.unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let method = request.method().to_string();

    let decision = if state.settings.enabled {
        Some(state.limiter.check(&identifier, Some(&endpoint)).await)
    } else {
        None
    };

    if let Some(denied) = decision.filter(|d| !d.allowed) {
        tracing::debug!(client = %identifier, path = %path, retry_after = denied.wait_time, "Rejecting request");
        state.metrics.record(
            "requests_total",
            1.0,
            &[
                ("method", method),
                ("endpoint", route_label),
                ("status", StatusCode::TOO_MANY_REQUESTS.as_u16().to_string()),
            ],
        );
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
        if let Some(headers) = denied.headers {
            headers.apply(response.headers_mut());
        }
        return response;
    }

    let sampling = state.sampler.decide();
    request.extensions_mut().insert(sampling);

    let start = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = start.elapsed();

    let status = response.status();
    let had_error = status.is_server_error();
    state.sampler.record_request(elapsed, had_error);

    if status == StatusCode::UNAUTHORIZED && endpoint == state.settings.auth_endpoint {
        state.security.record_failed_login(&identifier);
    }

    let labels = [
        ("method", method),
        ("endpoint", route_label),
        ("status", status.as_u16().to_string()),
    ];
    state
        .metrics
        .record("request_duration_seconds", elapsed.as_secs_f64(), &labels);
    state.metrics.record("requests_total", 1.0, &labels);

    if let Some(headers) = decision.and_then(|d| d.headers) {
        headers.apply(response.headers_mut());
    }
    response
}
