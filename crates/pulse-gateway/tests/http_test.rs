//! Integration tests for the HTTP surface.
//!
//! These tests start a real HTTP server backed by an in-process upstream and
//! make actual requests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use async_trait::async_trait;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use pulse_cache::MemoryStoreConfig;
use pulse_coordinator::{
    AnalyticsQuery, AnalyticsUpstream, CoordinatorConfig, QuotaSpec, QuotaWindowKind, RawError,
    UpstreamFailure,
};
use pulse_gateway::AppState;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl AnalyticsUpstream for CountingUpstream {
    async fn run_query(&self, query: &AnalyticsQuery) -> Result<Value, RawError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match query.target_id.as_str() {
            "denied" => Err(UpstreamFailure::boxed("7 PERMISSION_DENIED: no access to property")),
            "broken" => Err(UpstreamFailure::boxed("3 INVALID_ARGUMENT: unknown dimension")),
            _ => Ok(json!({"rows": [[query.data_type, 42]]})),
        }
    }
}

/// Start test HTTP server on random port.
async fn start_test_server(config: CoordinatorConfig) -> (SocketAddr, Arc<CountingUpstream>) {
    // Install ring crypto provider for reqwest (idempotent)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let upstream = Arc::new(CountingUpstream::default());
    let state = Arc::new(
        AppState::with_upstream(upstream.clone(), MemoryStoreConfig::default(), config)
            .expect("Failed to initialize AppState"),
    );
    let app = pulse_gateway::http::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind HTTP listener");
    let addr = listener.local_addr().expect("Failed to get listener address");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("HTTP server failed to run");
    });

    (addr, upstream)
}

async fn post_query(client: &reqwest::Client, addr: SocketAddr, body: Value) -> reqwest::Response {
    client
        .post(format!("http://{addr}/v1/query"))
        .json(&body)
        .send()
        .await
        .expect("Failed to send query")
}

#[tokio::test]
async fn test_health() {
    let (addr, _upstream) = start_test_server(CoordinatorConfig::default()).await;

    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["background_tasks_running"], false);
}

#[tokio::test]
async fn test_query_miss_then_hit() {
    let (addr, upstream) = start_test_server(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();
    let request = json!({"data_type": "sessions", "target_id": "prop-1", "options": {"limit": 10}});

    let first = post_query(&client, addr, request.clone()).await;
    assert_eq!(first.status(), StatusCode::OK);
    let first: Value = first.json().await.unwrap();
    assert_eq!(first["success"], true);
    assert_eq!(first["source"], "api");
    assert_eq!(first["cached"], false);

    let second: Value = post_query(&client, addr, request).await.json().await.unwrap();
    assert_eq!(second["source"], "cache");
    assert_eq!(second["cached"], true);
    assert_eq!(second["data"], first["data"]);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_query_error_status_codes() {
    let (addr, _upstream) = start_test_server(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    let denied = post_query(&client, addr, json!({"data_type": "sessions", "target_id": "denied"})).await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "AUTH_ERROR");
    assert_eq!(body["error"]["retryable"], false);

    let invalid = post_query(&client, addr, json!({"data_type": "sessions", "target_id": "broken"})).await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let empty = post_query(&client, addr, json!({"data_type": "", "target_id": "prop-1"})).await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_quota_exhaustion_sets_retry_after() {
    let mut config = CoordinatorConfig::default();
    config.quota = config
        .quota
        .with_quota(QuotaSpec::new("hourly", QuotaWindowKind::Hourly, 1));
    let (addr, upstream) = start_test_server(config).await;
    let client = reqwest::Client::new();

    let ok = post_query(&client, addr, json!({"data_type": "sessions", "target_id": "a"})).await;
    assert_eq!(ok.status(), StatusCode::OK);

    let limited = post_query(&client, addr, json!({"data_type": "sessions", "target_id": "b"})).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 3600);
    let body: Value = limited.json().await.unwrap();
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch() {
    let (addr, _upstream) = start_test_server(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/v1/batch"))
        .header("x-user-id", "alice")
        .json(&json!({"data_types": ["sessions", "users"], "target_id": "prop-1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["succeeded"], 2);
    assert_eq!(body["results"]["users"]["success"], true);

    let empty = client
        .post(format!("http://{addr}/v1/batch"))
        .json(&json!({"data_types": [], "target_id": "prop-1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_surface() {
    let (addr, upstream) = start_test_server(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    for target in ["a", "b"] {
        post_query(&client, addr, json!({"data_type": "sessions", "target_id": target})).await;
    }

    let invalidated: Value = client
        .post(format!("http://{addr}/v1/admin/cache/invalidate/a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(invalidated["deleted"], 1);

    let cleared: Value = client
        .post(format!("http://{addr}/v1/admin/cache/clear"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["deleted"], 1);

    let flags: Value = client
        .post(format!("http://{addr}/v1/admin/optimizations"))
        .json(&json!({"caching": false}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(flags["caching"], false);
    assert_eq!(flags["deduplication"], true);

    for _ in 0..2 {
        post_query(&client, addr, json!({"data_type": "sessions", "target_id": "c"})).await;
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 4);

    let warm = client
        .post(format!("http://{addr}/v1/admin/warm"))
        .send()
        .await
        .unwrap();
    assert_eq!(warm.status(), StatusCode::OK);

    let stats: Value = reqwest::get(format!("http://{addr}/v1/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["coordinator"]["upstream_calls"], 4);
    assert_eq!(stats["optimizations"]["caching"], false);
    assert!(stats["quotas"].as_array().is_some_and(|q| q.len() == 2));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (addr, _upstream) = start_test_server(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();
    post_query(&client, addr, json!({"data_type": "sessions", "target_id": "m"})).await;

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = response.text().await.unwrap();
    assert!(text.contains("pulse_cache_misses_total 1"));
    assert!(text.contains("pulse_upstream_calls_total 1"));
}
