//! End-to-end behaviour of the coordination layer
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use pulse_cache::{
    CacheError, CacheResult, CacheStore, KeyTtl, ManualClock, MemoryStore, MemoryStoreConfig,
    QueryOptions, SharedClock,
};
use pulse_coordinator::{
    AlertLevel, AnalyticsQuery, AnalyticsService, AnalyticsUpstream, BucketConfig, ClassifiedError,
    CoordinatorConfig, ErrorKind, Interceptor, QuotaConfig, QuotaSpec, QuotaTracker,
    QuotaWindowKind, RateLimitConfig, RateLimiter, RawError, RequestContext, RetryManager,
    RetryPolicy, Source, UpstreamFailure,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Upstream that replays scripted failures before answering
#[derive(Default)]
struct ScriptedUpstream {
    calls: AtomicUsize,
    failures: Mutex<Vec<&'static str>>,
    delay: Option<Duration>,
}

impl ScriptedUpstream {
    fn failing_with(failures: &[&'static str]) -> Self {
        let mut failures = failures.to_vec();
        failures.reverse();
        Self {
            failures: Mutex::new(failures),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalyticsUpstream for ScriptedUpstream {
    async fn run_query(&self, query: &AnalyticsQuery) -> Result<Value, RawError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop();
        if let Some(message) = failure {
            return Err(UpstreamFailure::boxed(message));
        }
        Ok(json!({"rows": 5, "type": query.data_type}))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Store whose every call fails
#[derive(Debug)]
struct UnreachableStore;

#[async_trait]
impl CacheStore for UnreachableStore {
    async fn get(&self, _key: &str) -> CacheResult<Option<Bytes>> {
        Err(CacheError::Backend("ECONNREFUSED 127.0.0.1:6379".to_string()))
    }
    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> CacheResult<bool> {
        Err(CacheError::Backend("ECONNREFUSED 127.0.0.1:6379".to_string()))
    }
    async fn del(&self, _key: &str) -> CacheResult<bool> {
        Err(CacheError::Backend("ECONNREFUSED 127.0.0.1:6379".to_string()))
    }
    async fn ttl(&self, _key: &str) -> CacheResult<KeyTtl> {
        Err(CacheError::Backend("ECONNREFUSED 127.0.0.1:6379".to_string()))
    }
    async fn scan(&self, _pattern: &str) -> CacheResult<Vec<String>> {
        Err(CacheError::Backend("ECONNREFUSED 127.0.0.1:6379".to_string()))
    }
}

struct Harness {
    service: AnalyticsService,
    upstream: Arc<ScriptedUpstream>,
    clock: Arc<ManualClock>,
}

fn harness(upstream: ScriptedUpstream, config: CoordinatorConfig) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let shared: SharedClock = clock.clone();
    let store = Arc::new(MemoryStore::with_clock(MemoryStoreConfig::default(), Arc::clone(&shared)).unwrap());
    let upstream = Arc::new(upstream);
    let service = AnalyticsService::builder(upstream.clone(), store)
        .config(config)
        .clock(shared)
        .build()
        .unwrap();
    Harness {
        service,
        upstream,
        clock,
    }
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_fetch() {
    let h = harness(
        ScriptedUpstream::slow(Duration::from_millis(50)),
        CoordinatorConfig::default(),
    );

    let (a, b) = tokio::join!(
        h.service.resolve("sessions", "propX", QueryOptions::default()),
        h.service.resolve("sessions", "propX", QueryOptions::default()),
    );

    assert!(a.success && b.success);
    assert_eq!(a.data, Some(json!({"rows": 5, "type": "sessions"})));
    assert_eq!(a.data, b.data);
    assert_eq!(h.upstream.calls(), 1);
    assert_eq!(h.service.stats().coordinator.dedup_joins, 1);
}

#[tokio::test]
async fn test_fetch_count_is_one_for_any_concurrency() {
    for n in [2usize, 8, 32] {
        let h = harness(
            ScriptedUpstream::slow(Duration::from_millis(20)),
            CoordinatorConfig::default(),
        );
        let responses = futures::future::join_all(
            (0..n).map(|_| h.service.resolve("users", "prop-1", QueryOptions::default())),
        )
        .await;

        assert!(responses.iter().all(|r| r.success), "n = {n}");
        assert_eq!(h.upstream.calls(), 1, "n = {n}");
    }
}

#[tokio::test]
async fn test_cache_round_trip_before_ttl() {
    let h = harness(ScriptedUpstream::default(), CoordinatorConfig::default());
    let options = QueryOptions::new().with_dimension("country").with_limit(10);

    let first = h.service.resolve("sessions", "prop-1", options.clone()).await;
    h.clock.advance(Duration::from_secs(60));
    let second = h.service.resolve("sessions", "prop-1", options).await;

    assert_eq!(first.source, Source::Api);
    assert_eq!(second.source, Source::Cache);
    assert!(second.cached);
    assert_eq!(
        serde_json::to_vec(&first.data).unwrap(),
        serde_json::to_vec(&second.data).unwrap()
    );
    assert_eq!(h.upstream.calls(), 1);
}

#[tokio::test]
async fn test_realtime_entries_expire_quickly() {
    let h = harness(ScriptedUpstream::default(), CoordinatorConfig::default());

    h.service.resolve("realtime", "prop-1", QueryOptions::default()).await;
    h.clock.advance(Duration::from_secs(61));
    let again = h.service.resolve("realtime", "prop-1", QueryOptions::default()).await;

    assert_eq!(again.source, Source::Api);
    assert_eq!(h.upstream.calls(), 2);
}

#[test]
fn test_token_bucket_capacity_five() {
    let config = RateLimitConfig::default().with_category("burst", BucketConfig::new(5.0, 1.0));
    let limiter = RateLimiter::new(config, Arc::new(ManualClock::new()));

    for _ in 0..5 {
        assert!(limiter.admit("burst", 1).allowed);
    }
    let sixth = limiter.admit("burst", 1);
    assert!(!sixth.allowed);
    assert_eq!(sixth.retry_after_seconds, Some(1));
}

#[test]
fn test_quota_exhausts_then_resets_once() {
    let clock = Arc::new(ManualClock::new());
    let config = QuotaConfig {
        quotas: vec![QuotaSpec::new("hourly", QuotaWindowKind::Hourly, 100)],
        ..QuotaConfig::default()
    };
    let tracker = QuotaTracker::new(&config, clock.clone());
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&alerts);
    tracker.on_alert(move |alert| sink.lock().push(alert.level));

    for _ in 0..100 {
        tracker.track("hourly", 1).unwrap();
    }
    assert!(!tracker.check("hourly", 1).unwrap().allowed);
    assert_eq!(*alerts.lock(), vec![AlertLevel::Warning, AlertLevel::Critical]);

    // Several windows of downtime still reset exactly once.
    clock.advance(Duration::from_secs(3 * 3600 + 5));
    assert_eq!(tracker.roll_windows(), 1);
    assert_eq!(tracker.roll_windows(), 0);
    let after = tracker.check("hourly", 1).unwrap();
    assert!(after.allowed);
    assert_eq!(after.used, 0);
}

#[tokio::test(start_paused = true)]
async fn test_network_failures_retry_with_bounded_delays() {
    let manager = RetryManager::new(
        "test",
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(1000)),
    );
    let attempts = Mutex::new(Vec::new());

    let result: Result<Value, ClassifiedError> = manager
        .execute_with_retry(|| {
            attempts.lock().push(tokio::time::Instant::now());
            async { Err(UpstreamFailure::boxed("read ECONNRESET")) }
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);

    let attempts = attempts.lock();
    assert_eq!(attempts.len(), 4);
    for (i, pair) in attempts.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        let ceiling = Duration::from_millis(1000).min(Duration::from_millis(100) * 2u32.pow(i as u32));
        assert!(gap <= ceiling, "gap {i}: {gap:?} > {ceiling:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_not_surfaced() {
    let h = harness(
        ScriptedUpstream::failing_with(&["read ECONNRESET", "14 UNAVAILABLE: Connection dropped"]),
        CoordinatorConfig::default(),
    );

    let response = h.service.resolve("sessions", "prop-1", QueryOptions::default()).await;

    assert!(response.success);
    assert!(response.error.is_none());
    assert_eq!(h.upstream.calls(), 3);
    assert_eq!(h.service.stats().retries["standard"].retries, 2);
}

#[tokio::test]
async fn test_cache_outage_is_absorbed() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let service = AnalyticsService::builder(upstream.clone(), Arc::new(UnreachableStore))
        .build()
        .unwrap();

    let first = service.resolve("sessions", "prop-1", QueryOptions::default()).await;
    let second = service.resolve("sessions", "prop-1", QueryOptions::default()).await;

    assert!(first.success);
    assert_eq!(first.source, Source::Api);
    assert_eq!(second.source, Source::Api);
    assert_eq!(upstream.calls(), 2);

    let stats = service.stats().coordinator;
    assert_eq!(stats.cache_read_failures, 2);
    assert_eq!(stats.cache_write_failures, 2);
}

#[tokio::test]
async fn test_rate_limit_denial_surfaces_retry_hint() {
    let mut config = CoordinatorConfig::default();
    config.rate_limit = config
        .rate_limit
        .with_category("reporting", BucketConfig::new(1.0, 0.001));
    let h = harness(ScriptedUpstream::default(), config);

    assert!(h.service.resolve("sessions", "a", QueryOptions::default()).await.success);
    let denied = h.service.resolve("sessions", "b", QueryOptions::default()).await;

    let error = denied.error.unwrap();
    assert_eq!(error.kind, Some(ErrorKind::RateLimit));
    assert_eq!(error.code, "RATE_LIMITED");
    assert!(error.retryable);
    assert_eq!(error.retry_after_seconds, Some(1000));
    assert_eq!(h.upstream.calls(), 1);
    assert_eq!(h.service.metrics().rate_limit_denials.get(), 1);
}

#[tokio::test]
async fn test_quota_gate_blocks_upstream() {
    let mut config = CoordinatorConfig::default();
    config.quota = config
        .quota
        .with_quota(QuotaSpec::new("hourly", QuotaWindowKind::Hourly, 2));
    let h = harness(ScriptedUpstream::default(), config);

    for target in ["a", "b"] {
        assert!(h.service.resolve("sessions", target, QueryOptions::default()).await.success);
    }
    let blocked = h.service.resolve("sessions", "c", QueryOptions::default()).await;

    let error = blocked.error.unwrap();
    assert_eq!(error.kind, Some(ErrorKind::Quota));
    assert!(error.retry_after_seconds.is_some_and(|s| s > 0 && s <= 3600));
    assert_eq!(h.upstream.calls(), 2);

    // Cached results stay available while the quota is exhausted.
    let cached = h.service.resolve("sessions", "a", QueryOptions::default()).await;
    assert_eq!(cached.source, Source::Cache);
}

#[tokio::test]
async fn test_non_retryable_failure_is_final() {
    let h = harness(
        ScriptedUpstream::failing_with(&["3 INVALID_ARGUMENT: Field browserz is not a valid dimension"]),
        CoordinatorConfig::default(),
    );

    let response = h.service.resolve("sessions", "prop-1", QueryOptions::default()).await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.kind, Some(ErrorKind::Validation));
    assert!(!error.retryable);
    assert_eq!(h.upstream.calls(), 1);
}

#[tokio::test]
async fn test_warming_refreshes_entries_close_to_expiry() {
    let h = harness(ScriptedUpstream::default(), CoordinatorConfig::default());
    for _ in 0..3 {
        h.service.resolve("sessions", "prop-1", QueryOptions::default()).await;
    }
    assert_eq!(h.upstream.calls(), 1);

    let fresh = h.service.warm_now().await;
    assert_eq!(fresh.planned, 1);
    assert_eq!(fresh.skipped_fresh, 1);
    assert_eq!(h.upstream.calls(), 1);

    h.clock.advance(Duration::from_secs(26 * 60));
    let cycle = h.service.warm_now().await;
    assert_eq!(cycle.warmed, 1);
    assert_eq!(h.upstream.calls(), 2);

    // Past the original expiry the warmed entry still serves.
    h.clock.advance(Duration::from_secs(10 * 60));
    let response = h.service.resolve("sessions", "prop-1", QueryOptions::default()).await;
    assert_eq!(response.source, Source::Cache);
    assert_eq!(h.service.stats().warmer.warmed, 1);
}

struct BlockList;

impl Interceptor for BlockList {
    fn name(&self) -> &str {
        "block-list"
    }

    fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ClassifiedError> {
        if ctx.target_id == "blocked" {
            return Err(ClassifiedError::new(ErrorKind::Auth, "target is blocked"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_interceptor_rejection_never_reaches_upstream() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let store = Arc::new(MemoryStore::new(MemoryStoreConfig::default()).unwrap());
    let service = AnalyticsService::builder(upstream.clone(), store)
        .interceptor(Arc::new(BlockList))
        .build()
        .unwrap();

    let rejected = service.resolve("sessions", "blocked", QueryOptions::default()).await;
    assert_eq!(rejected.error_kind(), Some(ErrorKind::Auth));
    assert_eq!(upstream.calls(), 0);

    assert!(service.resolve("sessions", "open", QueryOptions::default()).await.success);
}

#[tokio::test]
async fn test_quota_alert_callback_through_service() {
    let mut config = CoordinatorConfig::default();
    config.quota = config
        .quota
        .with_quota(QuotaSpec::new("hourly", QuotaWindowKind::Hourly, 10));
    let h = harness(ScriptedUpstream::default(), config);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.service
        .on_quota_alert(move |alert| sink.lock().push((alert.quota_type.clone(), alert.level)));

    for i in 0..9 {
        h.service
            .resolve("sessions", &format!("prop-{i}"), QueryOptions::default())
            .await;
    }

    assert_eq!(
        *seen.lock(),
        vec![
            ("hourly".to_string(), AlertLevel::Warning),
            ("hourly".to_string(), AlertLevel::Critical),
        ]
    );
}
