//! Fixed-window rate limiting on top of the resilient counter store.
//!
//! Each `(identifier, endpoint)` pair owns one counter key. The first request
//! in a window creates the key with a TTL of `window_seconds`; the key then
//! simply expires. Increment and expiry happen in one atomic store call.
//!
//! Store failures never block traffic: the limiter fails open.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::{EndpointLimitConfig, RateLimitConfig};
use crate::observability::metrics::MetricsSink;
use crate::resilience::ResilientStore;
use crate::store::StoreError;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const GLOBAL_LABEL: &str = "global";
const DEFAULT_LABEL: &str = "default";

/// Composite counter key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub identifier: String,
    pub endpoint: Option<String>,
}

impl RateLimitKey {
    pub fn new(identifier: &str, endpoint: Option<&str>) -> Self {
        Self {
            identifier: identifier.to_string(),
            endpoint: endpoint.map(str::to_string),
        }
    }

    pub fn storage_key(&self, prefix: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}:{}:{}", prefix, self.identifier, endpoint),
            None => format!("{}:{}", prefix, self.identifier),
        }
    }
}

/// Headers describing the caller's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the window resets.
    pub reset: u64,
    /// Present only on denial.
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
        if let Some(retry_after) = self.retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }
}

/// Outcome of a rate limit check. Denial is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds the caller should wait; zero when allowed.
    pub wait_time: u64,
    /// `None` when the decision was made without the store.
    pub headers: Option<RateLimitHeaders>,
}

impl RateLimitDecision {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            wait_time: 0,
            headers: None,
        }
    }
}

/// Fixed-window limiter with per-endpoint overrides.
pub struct RateLimiter {
    store: Arc<ResilientStore>,
    default_rule: EndpointLimitConfig,
    endpoints: HashMap<String, EndpointLimitConfig>,
    key_prefix: String,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<ResilientStore>,
        config: &RateLimitConfig,
        key_prefix: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            default_rule: EndpointLimitConfig {
                window_seconds: config.default_window_seconds,
                max_requests: config.default_max_requests,
            },
            endpoints: config.endpoints.clone(),
            key_prefix: key_prefix.into(),
            metrics,
        }
    }

    pub fn store(&self) -> &ResilientStore {
        &self.store
    }

    /// Limit that applies to `endpoint`, falling back to the default.
    pub fn rule_for(&self, endpoint: Option<&str>) -> EndpointLimitConfig {
        endpoint
            .and_then(|e| self.endpoints.get(e))
            .copied()
            .unwrap_or(self.default_rule)
    }

    /// Bounded metric label for `endpoint`: the override key when one is
    /// configured, `"default"` otherwise, `"global"` for identifier-wide checks.
    pub fn endpoint_label(&self, endpoint: Option<&str>) -> String {
        match endpoint {
            None => GLOBAL_LABEL.to_string(),
            Some(e) if self.endpoints.contains_key(e) => e.to_string(),
            Some(_) => DEFAULT_LABEL.to_string(),
        }
    }

    /// Count one request against the identifier's global window.
    pub async fn check_global(&self, identifier: &str) -> RateLimitDecision {
        self.check(identifier, None).await
    }

    /// Count one request for `identifier` on `endpoint` and decide.
    pub async fn check(&self, identifier: &str, endpoint: Option<&str>) -> RateLimitDecision {
        let rule = self.rule_for(endpoint);
        let key = RateLimitKey::new(identifier, endpoint).storage_key(&self.key_prefix);
        let window = rule.window_seconds;

        let counted = self
            .store
            .execute_with_retry("incr_window", |mut handle| {
                let key = key.clone();
                async move { handle.incr_with_expiry(&key, window).await }
            })
            .await;

        let path = endpoint.unwrap_or(GLOBAL_LABEL);
        let endpoint_label = self.endpoint_label(endpoint);
        match counted {
            Ok((count, ttl)) => self.decide(rule, count, ttl, identifier, path, endpoint_label),
            Err(StoreError::Unavailable(reason)) => {
                tracing::warn!(client = %identifier, endpoint = %path, reason = %reason, "Counter store unavailable, failing open");
                self.record_fail_open(endpoint_label, "unavailable");
                RateLimitDecision::fail_open()
            }
            Err(StoreError::Transient(reason)) => {
                tracing::warn!(client = %identifier, endpoint = %path, reason = %reason, "Counter store error, failing open");
                self.record_fail_open(endpoint_label, "transient");
                RateLimitDecision::fail_open()
            }
        }
    }

    fn decide(
        &self,
        rule: EndpointLimitConfig,
        count: u64,
        ttl: i64,
        identifier: &str,
        path: &str,
        endpoint_label: String,
    ) -> RateLimitDecision {
        let remaining = rule.max_requests.saturating_sub(count);
        let reset = ttl.max(0) as u64;
        let allowed = count <= rule.max_requests;
        let wait_time = if allowed { 0 } else { reset };

        self.metrics.record(
            "rate_limit_remaining",
            remaining as f64,
            &[("endpoint", endpoint_label.clone())],
        );
        if !allowed {
            tracing::warn!(client = %identifier, endpoint = %path, count, limit = rule.max_requests, retry_after = wait_time, "Rate limit exceeded");
            self.metrics
                .record("rate_limit_exceeded_total", 1.0, &[("endpoint", endpoint_label)]);
        }

        RateLimitDecision {
            allowed,
            wait_time,
            headers: Some(RateLimitHeaders {
                limit: rule.max_requests,
                remaining,
                reset,
                retry_after: (!allowed).then_some(wait_time),
            }),
        }
    }

    fn record_fail_open(&self, endpoint_label: String, cause: &'static str) {
        self.metrics.record(
            "rate_limit_fail_open_total",
            1.0,
            &[("endpoint", endpoint_label), ("cause", cause.to_string())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::RecordingSink;
    use crate::resilience::{CircuitBreaker, RetryPolicy};
    use crate::store::{CounterConnection, Endpoint, MemoryBackend, StoreBackend, StoreResult};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time;

    struct RefusingBackend;

    #[async_trait]
    impl StoreBackend for RefusingBackend {
        async fn resolve_endpoint(&self) -> StoreResult<Endpoint> {
            Ok(Endpoint::new("127.0.0.1", 1))
        }

        async fn connect(&self, _endpoint: &Endpoint) -> StoreResult<Box<dyn CounterConnection>> {
            Err(StoreError::Transient("connection refused".into()))
        }
    }

    fn limiter_with(
        backend: Arc<dyn StoreBackend>,
        config: RateLimitConfig,
    ) -> (RateLimiter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(ResilientStore::new(
            backend,
            CircuitBreaker::new(5, Duration::from_secs(60)),
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100)),
            Duration::from_secs(1),
            sink.clone(),
        ));
        (RateLimiter::new(store, &config, "rate_limit", sink.clone()), sink)
    }

    fn login_config() -> RateLimitConfig {
        let mut config = RateLimitConfig::default();
        config.endpoints.insert(
            "/login".into(),
            EndpointLimitConfig {
                window_seconds: 60,
                max_requests: 3,
            },
        );
        config
    }

    #[test]
    fn test_storage_key() {
        assert_eq!(
            RateLimitKey::new("1.2.3.4", Some("/login")).storage_key("rl"),
            "rl:1.2.3.4:/login"
        );
        assert_eq!(RateLimitKey::new("1.2.3.4", None).storage_key("rl"), "rl:1.2.3.4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_window_scenario() {
        let (limiter, sink) = limiter_with(Arc::new(MemoryBackend::new()), login_config());

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("1.2.3.4", Some("/login")).await;
            assert!(decision.allowed);
            let headers = decision.headers.unwrap();
            assert_eq!(headers.limit, 3);
            assert_eq!(headers.remaining, expected_remaining);
            assert_eq!(headers.retry_after, None);
        }

        time::advance(Duration::from_secs(5)).await;
        let denied = limiter.check("1.2.3.4", Some("/login")).await;
        assert!(!denied.allowed);
        assert_eq!(denied.wait_time, 55);
        let headers = denied.headers.unwrap();
        assert_eq!(headers.remaining, 0);
        assert_eq!(headers.retry_after, Some(55));
        assert_eq!(sink.total("rate_limit_exceeded_total"), 1.0);

        time::advance(Duration::from_secs(56)).await;
        let fresh = limiter.check("1.2.3.4", Some("/login")).await;
        assert!(fresh.allowed);
        assert_eq!(fresh.headers.unwrap().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_override_and_default_are_independent() {
        let (limiter, _) = limiter_with(Arc::new(MemoryBackend::new()), login_config());

        assert_eq!(limiter.rule_for(Some("/login")).max_requests, 3);
        assert_eq!(limiter.rule_for(Some("/search")).max_requests, 100);
        assert_eq!(limiter.rule_for(None).max_requests, 100);

        for _ in 0..3 {
            limiter.check("1.2.3.4", Some("/login")).await;
        }
        assert!(!limiter.check("1.2.3.4", Some("/login")).await.allowed);

        let global = limiter.check_global("1.2.3.4").await;
        assert!(global.allowed);
        assert_eq!(global.headers.unwrap().remaining, 99);

        let other_client = limiter.check("5.6.7.8", Some("/login")).await;
        assert!(other_client.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metric_labels_are_bounded() {
        let (limiter, sink) = limiter_with(Arc::new(MemoryBackend::new()), login_config());

        limiter.check("1.2.3.4", Some("/login")).await;
        for i in 0..5 {
            limiter.check("1.2.3.4", Some(&format!("/scan/{}", i))).await;
        }
        limiter.check_global("1.2.3.4").await;

        let mut labels: Vec<String> = sink
            .named("rate_limit_remaining")
            .into_iter()
            .map(|r| r.labels[0].1.clone())
            .collect();
        labels.dedup();
        assert_eq!(labels, ["/login", "default", "global"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_stays_within_bounds() {
        let mut config = RateLimitConfig::default();
        config.default_max_requests = 2;
        let (limiter, _) = limiter_with(Arc::new(MemoryBackend::new()), config);

        for _ in 0..10 {
            let headers = limiter.check("c", Some("/x")).await.headers.unwrap();
            assert!(headers.remaining <= 2);
            assert!(headers.reset <= 60);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_fails_open() {
        let (limiter, sink) = limiter_with(Arc::new(RefusingBackend), login_config());

        for _ in 0..5 {
            let decision = limiter.check("1.2.3.4", Some("/login")).await;
            assert_eq!(
                decision,
                RateLimitDecision {
                    allowed: true,
                    wait_time: 0,
                    headers: None,
                }
            );
        }
        assert_eq!(sink.total("rate_limit_fail_open_total"), 5.0);
        assert!(limiter.store().breaker().is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_share_one_window() {
        let mut config = RateLimitConfig::default();
        config.default_max_requests = 10;
        let (limiter, _) = limiter_with(Arc::new(MemoryBackend::new()), config);
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("burst", Some("/api")).await.allowed })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_headers_applied() {
        let mut map = HeaderMap::new();
        RateLimitHeaders {
            limit: 3,
            remaining: 0,
            reset: 42,
            retry_after: Some(42),
        }
        .apply(&mut map);

        assert_eq!(map["x-ratelimit-limit"], "3");
        assert_eq!(map["x-ratelimit-remaining"], "0");
        assert_eq!(map["x-ratelimit-reset"], "42");
        assert_eq!(map["retry-after"], "42");

        let mut map = HeaderMap::new();
        RateLimitHeaders {
            limit: 3,
            remaining: 2,
            reset: 60,
            retry_after: None,
        }
        .apply(&mut map);
        assert!(map.get("retry-after").is_none());
    }
}
