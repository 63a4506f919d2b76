//! In-process tests of the enforcement middleware over the full router.

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use overload_guard::config::EndpointLimitConfig;
use overload_guard::security::SecurityMonitor;
use overload_guard::Guard;
use tower::ServiceExt;

mod common;

#[derive(Default)]
struct CollectingMonitor {
    failed: Mutex<Vec<String>>,
}

impl SecurityMonitor for CollectingMonitor {
    fn record_failed_login(&self, identifier: &str) {
        self.failed.lock().unwrap().push(identifier.to_string());
    }
}

#[tokio::test]
async fn test_allowed_response_carries_rate_headers() {
    let config = common::test_config();
    let (guard, sink) = common::memory_guard(&config);
    let router = common::server(&config, guard).router();

    let res = router.oneshot(common::get_from("/", "203.0.113.1")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(common::header_u64(&res, "x-ratelimit-limit"), Some(100));
    assert_eq!(common::header_u64(&res, "x-ratelimit-remaining"), Some(99));
    let reset = common::header_u64(&res, "x-ratelimit-reset").unwrap();
    assert!(reset > 0 && reset <= 60);
    assert!(res.headers().get("retry-after").is_none());

    assert_eq!(sink.total("requests_total"), 1.0);
    assert_eq!(sink.named("request_duration_seconds").len(), 1);
}

#[tokio::test]
async fn test_login_override_rejects_fourth_attempt() {
    let mut config = common::test_config();
    config.rate_limit.endpoints.insert(
        "/auth/login".into(),
        EndpointLimitConfig {
            window_seconds: 60,
            max_requests: 3,
        },
    );
    let (guard, sink) = common::memory_guard(&config);
    let monitor = Arc::new(CollectingMonitor::default());
    let guard = guard.with_security_monitor(monitor.clone());
    let router = common::server(&config, guard).router();

    for expected_remaining in [2, 1, 0] {
        let res = router
            .clone()
            .oneshot(common::post_from("/auth/login", "198.51.100.4"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(common::header_u64(&res, "x-ratelimit-limit"), Some(3));
        assert_eq!(common::header_u64(&res, "x-ratelimit-remaining"), Some(expected_remaining));
    }

    let res = router
        .clone()
        .oneshot(common::post_from("/auth/login", "198.51.100.4"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(common::header_u64(&res, "x-ratelimit-remaining"), Some(0));
    let retry_after = common::header_u64(&res, "retry-after").unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    // Rejected before the handler: only three 401s were seen.
    assert_eq!(*monitor.failed.lock().unwrap(), vec!["198.51.100.4"; 3]);
    assert_eq!(sink.total("rate_limit_exceeded_total"), 1.0);

    // Other paths use the default rule and a separate window.
    let res = router.oneshot(common::get_from("/", "198.51.100.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(common::header_u64(&res, "x-ratelimit-limit"), Some(100));
}

#[tokio::test]
async fn test_clients_are_limited_independently() {
    let mut config = common::test_config();
    config.rate_limit.default_max_requests = 1;
    let (guard, _) = common::memory_guard(&config);
    let router = common::server(&config, guard).router();

    let first = router.clone().oneshot(common::get_from("/", "10.0.0.1")).await.unwrap();
    let second = router.clone().oneshot(common::get_from("/", "10.0.0.1")).await.unwrap();
    let other = router.oneshot(common::get_from("/", "10.0.0.2")).await.unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_server_errors_feed_the_sampler() {
    let config = common::test_config();
    let (guard, _) = common::memory_guard(&config);
    let sampler = guard.sampler().clone();
    let router = common::server(&config, guard).router();

    let res = router.clone().oneshot(common::get_from("/boom", "10.0.0.9")).await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let res = router.oneshot(common::get_from("/", "10.0.0.9")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let counts = sampler.window_counts();
    assert_eq!(counts.request_count, 2);
    assert_eq!(counts.error_count, 1);
}

#[tokio::test]
async fn test_rejected_requests_skip_the_sampler() {
    let mut config = common::test_config();
    config.rate_limit.default_max_requests = 1;
    let (guard, _) = common::memory_guard(&config);
    let sampler = guard.sampler().clone();
    let router = common::server(&config, guard).router();

    for _ in 0..3 {
        let _ = router.clone().oneshot(common::get_from("/", "10.0.0.3")).await.unwrap();
    }
    assert_eq!(sampler.window_counts().request_count, 1);
}

#[tokio::test]
async fn test_store_outage_fails_open_without_headers() {
    let config = common::test_config();
    let backend = Arc::new(common::SwitchableBackend::down());
    let sink = Arc::new(overload_guard::observability::RecordingSink::new());
    let guard = Guard::with_backend(&config, backend.clone(), sink.clone());
    let router = common::server(&config, guard).router();

    for _ in 0..3 {
        let res = router.clone().oneshot(common::get_from("/", "10.0.0.5")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get("x-ratelimit-limit").is_none());
    }
    assert_eq!(sink.total("rate_limit_fail_open_total"), 3.0);
}

#[tokio::test]
async fn test_disabled_limiting_never_touches_the_store() {
    let mut config = common::test_config();
    config.rate_limit.enabled = false;
    config.rate_limit.default_max_requests = 1;
    let backend = Arc::new(common::SwitchableBackend::down());
    let guard = Guard::with_backend(
        &config,
        backend.clone(),
        Arc::new(overload_guard::observability::NoopSink),
    );
    let router = common::server(&config, guard).router();

    for _ in 0..5 {
        let res = router.clone().oneshot(common::get_from("/", "10.0.0.6")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get("x-ratelimit-limit").is_none());
    }
    assert_eq!(backend.connect_attempts(), 0);
}

#[tokio::test]
async fn test_guard_routes_are_not_limited() {
    let mut config = common::test_config();
    config.rate_limit.default_max_requests = 1;
    let (guard, _) = common::memory_guard(&config);
    let router = common::server(&config, guard).router();

    for _ in 0..5 {
        let res = router.clone().oneshot(common::get_from("/health", "10.0.0.7")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get("x-ratelimit-limit").is_none());
    }

    let res = router
        .oneshot(Request::builder().uri("/_guard/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["circuit"]["is_open"], false);
    assert_eq!(status["sample_rates"]["trace"], 1.0);
}

#[tokio::test]
async fn test_metrics_label_by_route_pattern() {
    let config = common::test_config();
    let (guard, sink) = common::memory_guard(&config);
    let router = common::server(&config, guard).router();

    for path in ["/items/1", "/items/2", "/api/items"] {
        let _ = router.clone().oneshot(common::get_from(path, "10.0.0.8")).await.unwrap();
    }

    let endpoints: Vec<String> = sink
        .named("requests_total")
        .into_iter()
        .flat_map(|r| r.labels.into_iter())
        .filter(|(key, _)| *key == "endpoint")
        .map(|(_, value)| value)
        .collect();
    assert_eq!(endpoints, ["/items/{id}", "/items/{id}", "/api/items"]);
}

#[tokio::test]
async fn test_path_parameters_share_one_window() {
    let mut config = common::test_config();
    config.rate_limit.default_max_requests = 1;
    let (guard, _) = common::memory_guard(&config);
    let router = common::server(&config, guard).router();

    let first = router.clone().oneshot(common::get_from("/items/1", "10.0.0.4")).await.unwrap();
    let second = router.oneshot(common::get_from("/items/2", "10.0.0.4")).await.unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}
