//! Caller-facing analytics service
//!
//! [`AnalyticsService`] wires every component together behind the operations
//! callers and operators use: `resolve`, batch resolution, and the admin
//! surface. Upstream calls go through the admission gate (rate limiter then
//! quotas), the retry profile for the data type, and the coordinator's
//! cache and deduplication path.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use pulse_cache::key::KEY_PREFIX;
use pulse_cache::{CacheError, CacheStore, QueryOptions, RequestKey, SharedClock, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::analytics::{FlagAutoApply, PerformanceAnalytics, PerformanceReport};
use crate::config::{CoordinatorConfig, OperationClass, OptimizationFlags, OptimizationUpdate};
use crate::coordinator::{CachePolicy, CoordinatorStats, RequestCoordinator, Resolved, Source};
use crate::error::{ClassifiedError, ConfigError, CoordinatorError, ErrorKind, RawError};
use crate::interceptor::{Interceptor, InterceptorChain, RequestContext};
use crate::metrics::PulseMetrics;
use crate::quota::{QuotaAlert, QuotaSnapshot, QuotaTracker};
use crate::rate_limit::{BucketSnapshot, RateLimiter};
use crate::retry::{RetryManager, RetryStats};
use crate::upstream::{AnalyticsQuery, AnalyticsUpstream};
use crate::usage::UsageTracker;
use crate::warmer::{CacheWarmer, WarmCycleReport, WarmExecutor, WarmerStats};

/// Error details returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    /// Upstream taxonomy kind; absent for coordinator queue conditions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub code: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl From<&CoordinatorError> for ErrorBody {
    fn from(err: &CoordinatorError) -> Self {
        let message = match err {
            CoordinatorError::Upstream(e) => e.message().to_string(),
            other => other.to_string(),
        };
        Self {
            message,
            kind: err.upstream_kind(),
            code: err.code().to_string(),
            retryable: err.is_retryable(),
            retry_after_seconds: err.retry_after().map(|d| d.as_secs_f64().ceil() as u64),
        }
    }
}

/// Result of one caller-facing resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub source: Source,
    pub cached: bool,
    pub response_time_ms: u64,
}

impl ServiceResponse {
    pub(crate) const fn empty(source: Source) -> Self {
        Self {
            success: false,
            data: None,
            error: None,
            source,
            cached: false,
            response_time_ms: 0,
        }
    }

    fn from_resolved(resolved: Resolved) -> Self {
        Self {
            success: true,
            cached: resolved.cache_hit,
            source: resolved.source,
            response_time_ms: resolved.elapsed.as_millis() as u64,
            data: Some(resolved.value),
            error: None,
        }
    }

    fn from_error(err: &CoordinatorError, elapsed: Duration) -> Self {
        Self {
            error: Some(ErrorBody::from(err)),
            response_time_ms: elapsed.as_millis() as u64,
            ..Self::empty(Source::Error)
        }
    }

    /// The final error, if any, as a coordinator error kind.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().and_then(|e| e.kind)
    }
}

/// Per-data-type results of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: BTreeMap<String, ServiceResponse>,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTotals {
    pub admitted: u64,
    pub denied: u64,
}

/// Everything the stats endpoint reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub coordinator: CoordinatorStats,
    pub hit_rate: f64,
    pub rate_limits: Vec<BucketSnapshot>,
    pub rate_limit_totals: RateLimitTotals,
    pub quotas: Vec<QuotaSnapshot>,
    pub retries: BTreeMap<String, RetryStats>,
    pub warmer: WarmerStats,
    pub usage_patterns: usize,
    pub performance: PerformanceReport,
    pub optimizations: OptimizationFlags,
    pub background_tasks_running: bool,
}

struct ServiceInner {
    config: CoordinatorConfig,
    upstream: Arc<dyn AnalyticsUpstream>,
    coordinator: RequestCoordinator,
    rate_limiter: RateLimiter,
    quota: QuotaTracker,
    retry_realtime: RetryManager,
    retry_standard: RetryManager,
    retry_quota_sensitive: RetryManager,
    usage: Arc<UsageTracker>,
    warmer: CacheWarmer,
    analytics: Arc<PerformanceAnalytics>,
    interceptors: InterceptorChain,
    flags: Arc<RwLock<OptimizationFlags>>,
    metrics: Arc<PulseMetrics>,
    next_request_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`AnalyticsService`]
pub struct ServiceBuilder {
    config: CoordinatorConfig,
    upstream: Arc<dyn AnalyticsUpstream>,
    store: Arc<dyn CacheStore>,
    clock: SharedClock,
    interceptors: InterceptorChain,
    metrics: Option<Arc<PulseMetrics>>,
}

impl ServiceBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn metrics(mut self, metrics: Arc<PulseMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<AnalyticsService, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(PulseMetrics::new()?),
        };

        let analytics = Arc::new(PerformanceAnalytics::new(
            config.analytics.clone(),
            Arc::clone(&clock),
        ));
        let flags = Arc::new(RwLock::new(config.optimizations));
        analytics.add_auto_apply(Arc::new(FlagAutoApply::new(Arc::clone(&flags))));

        let coordinator = RequestCoordinator::new(self.store, config.dedup.clone(), Arc::clone(&clock))
            .with_analytics(Arc::clone(&analytics))
            .with_metrics(Arc::clone(&metrics));
        let usage = Arc::new(UsageTracker::new(Arc::clone(&clock)));
        let warmer = CacheWarmer::new(config.warmer.clone(), Arc::clone(&usage), Arc::clone(&clock));
        let retry = |name: &str, policy| RetryManager::new(name, policy).with_metrics(Arc::clone(&metrics));

        let inner = ServiceInner {
            upstream: self.upstream,
            coordinator,
            rate_limiter: RateLimiter::new(config.rate_limit.clone(), Arc::clone(&clock)),
            quota: QuotaTracker::new(&config.quota, Arc::clone(&clock)),
            retry_realtime: retry("realtime", config.retry.realtime.clone()),
            retry_standard: retry("standard", config.retry.standard.clone()),
            retry_quota_sensitive: retry("quota_sensitive", config.retry.quota_sensitive.clone()),
            usage,
            warmer,
            analytics,
            interceptors: self.interceptors,
            flags,
            metrics,
            next_request_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            config,
        };
        tracing::info!(
            upstream = inner.upstream.name(),
            store = inner.coordinator.store().backend_name(),
            "Analytics service ready"
        );
        Ok(AnalyticsService {
            inner: Arc::new(inner),
        })
    }
}

/// Cheap-to-clone handle to the coordination layer
#[derive(Clone)]
pub struct AnalyticsService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for AnalyticsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsService")
            .field("upstream", &self.inner.upstream.name())
            .field("coordinator", &self.inner.coordinator)
            .field("interceptors", &self.inner.interceptors)
            .finish_non_exhaustive()
    }
}

impl AnalyticsService {
    pub fn builder(upstream: Arc<dyn AnalyticsUpstream>, store: Arc<dyn CacheStore>) -> ServiceBuilder {
        ServiceBuilder {
            config: CoordinatorConfig::default(),
            upstream,
            store,
            clock: SystemClock::shared(),
            interceptors: InterceptorChain::new(),
            metrics: None,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<PulseMetrics> {
        &self.inner.metrics
    }

    /// Resolve one query for an anonymous caller.
    pub async fn resolve(&self, data_type: &str, target_id: &str, options: QueryOptions) -> ServiceResponse {
        self.inner.resolve(None, data_type, target_id, options).await
    }

    /// Resolve one query against the caller's own rate-limit bucket.
    pub async fn resolve_as(
        &self,
        user: &str,
        data_type: &str,
        target_id: &str,
        options: QueryOptions,
    ) -> ServiceResponse {
        self.inner
            .resolve(Some(user.to_string()), data_type, target_id, options)
            .await
    }

    /// Resolve several data types for one target, keyed by data type.
    pub async fn resolve_batch(
        &self,
        data_types: &[String],
        target_id: &str,
        options: QueryOptions,
        user: Option<&str>,
    ) -> Result<BatchResponse, ClassifiedError> {
        let mut unique: Vec<&str> = data_types.iter().map(String::as_str).collect();
        unique.sort_unstable();
        unique.dedup();

        if unique.is_empty() {
            return Err(ClassifiedError::validation("batch must name at least one data type"));
        }
        if unique.len() > self.inner.config.max_batch_size {
            return Err(ClassifiedError::validation(format!(
                "batch of {} data types exceeds the limit of {}",
                unique.len(),
                self.inner.config.max_batch_size
            )));
        }

        let parallel = self.inner.flags.read().batching;
        let user = user.map(str::to_string);
        let responses: Vec<(String, ServiceResponse)> = if parallel {
            futures::future::join_all(unique.iter().map(|data_type| {
                let options = options.clone();
                let user = user.clone();
                async move {
                    let response = self.inner.resolve(user, data_type, target_id, options).await;
                    ((*data_type).to_string(), response)
                }
            }))
            .await
        } else {
            let mut out = Vec::with_capacity(unique.len());
            for data_type in &unique {
                let response = self
                    .inner
                    .resolve(user.clone(), data_type, target_id, options.clone())
                    .await;
                out.push(((*data_type).to_string(), response));
            }
            out
        };

        let succeeded = responses.iter().filter(|(_, r)| r.success).count();
        Ok(BatchResponse {
            failed: responses.len() - succeeded,
            succeeded,
            results: responses.into_iter().collect(),
        })
    }

    /// Delete cached entries matching `pattern` (all entries when `None`).
    pub async fn clear_cache(&self, pattern: Option<&str>) -> Result<usize, CacheError> {
        let pattern = pattern.map_or_else(|| format!("{KEY_PREFIX}:*"), str::to_string);
        if pattern.trim().is_empty() {
            return Err(CacheError::InvalidPattern("empty pattern".to_string()));
        }
        self.inner.coordinator.invalidate_pattern(&pattern).await
    }

    /// Delete every cached entry for one target.
    pub async fn invalidate_target(&self, target_id: &str) -> Result<usize, CacheError> {
        self.inner
            .coordinator
            .invalidate_pattern(&RequestKey::target_pattern(target_id))
            .await
    }

    pub fn stats(&self) -> ServiceStats {
        self.inner.stats()
    }

    /// Run one warming cycle now, outside the schedule.
    pub async fn warm_now(&self) -> WarmCycleReport {
        let report = self.inner.warmer.run_cycle(self.inner.as_ref()).await;
        self.inner.metrics.warmed_entries.inc_by(report.warmed as u64);
        report
    }

    /// Refresh one query shape through the coordinator, regardless of usage.
    pub async fn warm_shape(&self, data_type: &str, target_id: &str, options: QueryOptions) -> ServiceResponse {
        let query = AnalyticsQuery::new(data_type, target_id, options);
        let started = tokio::time::Instant::now();
        match self.inner.execute(&query, None, true).await {
            Ok(resolved) => {
                self.inner.metrics.warmed_entries.inc();
                ServiceResponse::from_resolved(resolved)
            }
            Err(e) => ServiceResponse::from_error(&e, started.elapsed()),
        }
    }

    pub fn optimizations(&self) -> OptimizationFlags {
        *self.inner.flags.read()
    }

    pub fn set_optimizations(&self, update: OptimizationUpdate) -> OptimizationFlags {
        let mut flags = self.inner.flags.write();
        flags.apply(update);
        tracing::info!(flags = ?*flags, "Optimization flags updated");
        *flags
    }

    /// Register a callback for quota threshold crossings.
    pub fn on_quota_alert(&self, callback: impl Fn(&QuotaAlert) + Send + Sync + 'static) {
        self.inner.quota.on_alert(callback);
    }

    pub fn rollup(&self) -> PerformanceReport {
        self.inner.analytics.rollup()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tasks.lock().is_empty()
    }

    /// Spawn the warming, maintenance and rollup loops. No-op if already running.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let config = &self.inner.config;

        tasks.push(spawn_loop(
            Weak::clone(&weak),
            config.warmer.initial_delay,
            config.warmer.interval,
            |inner| async move {
                let warming = inner.flags.read().warming;
                if warming {
                    let report = inner.warmer.run_cycle(inner.as_ref()).await;
                    inner.metrics.warmed_entries.inc_by(report.warmed as u64);
                }
            },
        ));
        tasks.push(spawn_loop(
            Weak::clone(&weak),
            config.maintenance_interval,
            config.maintenance_interval,
            |inner| async move {
                inner.quota.roll_windows();
                inner.usage.decay(inner.config.usage_retention);
                inner.rate_limiter.sweep_idle(inner.config.maintenance_interval);
                inner
                    .metrics
                    .pending_requests
                    .set(inner.coordinator.pending_count() as i64);
            },
        ));
        tasks.push(spawn_loop(
            weak,
            config.analytics.rollup_interval,
            config.analytics.rollup_interval,
            |inner| async move {
                inner.analytics.rollup();
            },
        ));
        tracing::info!("Background loops started");
    }

    /// Cancel every background loop. Safe to call repeatedly.
    pub fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        tracing::info!("Background loops stopped");
    }
}

fn spawn_loop<F, Fut>(weak: Weak<ServiceInner>, initial_delay: Duration, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<ServiceInner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            tick(inner).await;
        }
    })
}

impl ServiceInner {
    async fn resolve(
        &self,
        user: Option<String>,
        data_type: &str,
        target_id: &str,
        options: QueryOptions,
    ) -> ServiceResponse {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut ctx = RequestContext::new(request_id, data_type, target_id, options, user);

        let ran = match self.interceptors.before(&mut ctx) {
            Ok(ran) => ran,
            Err((ran, rejection)) => {
                let mut response =
                    ServiceResponse::from_error(&rejection.into(), ctx.started_at.elapsed());
                self.interceptors.after(ran, &ctx, &mut response);
                return response;
            }
        };

        let mut response = match Self::validate(&ctx) {
            Err(e) => ServiceResponse::from_error(&e.into(), ctx.started_at.elapsed()),
            Ok(()) => {
                let query = AnalyticsQuery::new(&ctx.data_type, &ctx.target_id, ctx.options.clone());
                match self.execute(&query, ctx.user.as_deref(), false).await {
                    Ok(resolved) => {
                        self.usage.record(&query);
                        ServiceResponse::from_resolved(resolved)
                    }
                    Err(e) => {
                        if let Some(kind) = e.upstream_kind() {
                            self.metrics
                                .upstream_errors
                                .with_label_values(&[kind.as_str()])
                                .inc();
                        }
                        ServiceResponse::from_error(&e, ctx.started_at.elapsed())
                    }
                }
            }
        };

        self.interceptors.after(ran, &ctx, &mut response);
        response
    }

    fn validate(ctx: &RequestContext) -> Result<(), ClassifiedError> {
        if ctx.data_type.trim().is_empty() {
            return Err(ClassifiedError::validation("data type must not be empty"));
        }
        if ctx.target_id.trim().is_empty() {
            return Err(ClassifiedError::validation("target id must not be empty"));
        }
        if ctx.options.limit == Some(0) {
            return Err(ClassifiedError::validation("limit must be positive"));
        }
        Ok(())
    }

    /// Coordinator path shared by callers, the warmer and manual warming.
    async fn execute(
        &self,
        query: &AnalyticsQuery,
        user: Option<&str>,
        refresh: bool,
    ) -> Result<Resolved, CoordinatorError> {
        let flags = *self.flags.read();
        let policy = CachePolicy::new(self.config.cache_ttl.ttl_for(&query.data_type))
            .with_read(flags.caching)
            .with_write(flags.caching)
            .with_dedupe(flags.deduplication);
        let fetch = || self.fetch_upstream(query, user, flags.rate_limiting);

        if refresh {
            self.coordinator
                .refresh(&query.request_key, &policy.warmed(), fetch)
                .await
        } else {
            self.coordinator.resolve(&query.request_key, &policy, fetch).await
        }
    }

    fn retry_for(&self, data_type: &str) -> &RetryManager {
        match self.config.routing.class_of(data_type) {
            OperationClass::Realtime => &self.retry_realtime,
            OperationClass::Standard => &self.retry_standard,
            OperationClass::QuotaSensitive => &self.retry_quota_sensitive,
        }
    }

    async fn fetch_upstream(
        &self,
        query: &AnalyticsQuery,
        user: Option<&str>,
        rate_limiting: bool,
    ) -> Result<Value, ClassifiedError> {
        self.retry_for(&query.data_type)
            .execute_with_retry(|| async move {
                self.admit(query, user, rate_limiting)?;
                self.upstream.run_query(query).await
            })
            .await
    }

    /// Admission gate in front of every upstream attempt.
    fn admit(&self, query: &AnalyticsQuery, user: Option<&str>, rate_limiting: bool) -> Result<(), RawError> {
        if rate_limiting {
            let category = self.config.routing.category_of(&query.data_type);
            let admission = match user {
                Some(user) => self.rate_limiter.admit_for_user(category, user, 1),
                None => self.rate_limiter.admit(category, 1),
            };
            if !admission.allowed {
                self.metrics.rate_limit_denials.inc();
                return Err(Box::new(ClassifiedError::rate_limited(
                    format!("rate limit exceeded for {category} requests"),
                    admission.retry_after(),
                )));
            }
        }

        if let Err(denied) = self.quota.acquire_all(1) {
            self.metrics.quota_denials.inc();
            return Err(Box::new(ClassifiedError::quota_exceeded(
                format!(
                    "{} quota exhausted ({}/{})",
                    denied.quota_type, denied.used, denied.limit
                ),
                Some(denied.resets_in),
            )));
        }
        Ok(())
    }

    fn stats(&self) -> ServiceStats {
        let coordinator = self.coordinator.stats();
        let (admitted, denied) = self.rate_limiter.totals();
        let retries = [
            &self.retry_realtime,
            &self.retry_standard,
            &self.retry_quota_sensitive,
        ]
        .into_iter()
        .map(|m| (m.name().to_string(), m.stats()))
        .collect();

        ServiceStats {
            hit_rate: coordinator.hit_rate(),
            coordinator,
            rate_limits: self.rate_limiter.snapshot(),
            rate_limit_totals: RateLimitTotals { admitted, denied },
            quotas: self.quota.snapshot(),
            retries,
            warmer: self.warmer.stats(),
            usage_patterns: self.usage.len(),
            performance: self.analytics.report(),
            optimizations: *self.flags.read(),
            background_tasks_running: !self.tasks.lock().is_empty(),
        }
    }
}

#[async_trait]
impl WarmExecutor for ServiceInner {
    async fn remaining_ttl(&self, key: &RequestKey) -> Option<Duration> {
        self.coordinator.remaining_ttl(key).await
    }

    async fn warm(&self, query: &AnalyticsQuery) -> Result<(), CoordinatorError> {
        self.execute(query, None, true).await.map(|_| ())
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamFailure;
    use pulse_cache::{ManualClock, MemoryStore, MemoryStoreConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct EchoUpstream {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnalyticsUpstream for EchoUpstream {
        async fn run_query(&self, query: &AnalyticsQuery) -> Result<Value, RawError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.target_id == "forbidden" {
                return Err(UpstreamFailure::boxed("7 PERMISSION_DENIED: no access"));
            }
            Ok(json!({"type": query.data_type, "target": query.target_id}))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn service(config: CoordinatorConfig) -> (AnalyticsService, Arc<EchoUpstream>) {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let upstream = Arc::new(EchoUpstream::default());
        let store = Arc::new(MemoryStore::with_clock(MemoryStoreConfig::default(), Arc::clone(&clock)).unwrap());
        let service = AnalyticsService::builder(upstream.clone(), store)
            .config(config)
            .clock(clock)
            .build()
            .unwrap();
        (service, upstream)
    }

    #[tokio::test]
    async fn test_resolve_then_cached() {
        let (service, upstream) = service(CoordinatorConfig::default());

        let first = service.resolve("sessions", "prop-1", QueryOptions::default()).await;
        assert!(first.success);
        assert_eq!(first.source, Source::Api);
        assert!(!first.cached);

        let second = service.resolve("sessions", "prop-1", QueryOptions::default()).await;
        assert_eq!(second.source, Source::Cache);
        assert!(second.cached);
        assert_eq!(second.data, first.data);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.stats().usage_patterns, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_body() {
        let (service, upstream) = service(CoordinatorConfig::default());
        let response = service.resolve("sessions", "forbidden", QueryOptions::default()).await;

        assert!(!response.success);
        assert_eq!(response.source, Source::Error);
        let error = response.error.unwrap();
        assert_eq!(error.kind, Some(ErrorKind::Auth));
        assert_eq!(error.code, "AUTH_ERROR");
        assert!(!error.retryable);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_happens_before_upstream() {
        let (service, upstream) = service(CoordinatorConfig::default());
        let response = service.resolve("", "prop-1", QueryOptions::default()).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_caching_flag_off_always_fetches() {
        let (service, upstream) = service(CoordinatorConfig::default());
        service.set_optimizations(OptimizationUpdate {
            caching: Some(false),
            ..OptimizationUpdate::default()
        });
        for _ in 0..3 {
            assert!(service.resolve("sessions", "p", QueryOptions::default()).await.success);
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_batch_results_keyed_by_data_type() {
        let (service, _upstream) = service(CoordinatorConfig::default());
        let batch = service
            .resolve_batch(
                &["users".to_string(), "sessions".to_string(), "users".to_string()],
                "prop-1",
                QueryOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.succeeded, 2);
        assert_eq!(
            batch.results["users"].data,
            Some(json!({"type": "users", "target": "prop-1"}))
        );

        let too_many: Vec<String> = (0..50).map(|i| format!("t{i}")).collect();
        assert!(
            service
                .resolve_batch(&too_many, "prop-1", QueryOptions::default(), None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_invalidate_target_and_clear() {
        let (service, upstream) = service(CoordinatorConfig::default());
        service.resolve("sessions", "a", QueryOptions::default()).await;
        service.resolve("users", "a", QueryOptions::default()).await;
        service.resolve("sessions", "b", QueryOptions::default()).await;

        assert_eq!(service.invalidate_target("a").await.unwrap(), 2);
        service.resolve("sessions", "a", QueryOptions::default()).await;
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 4);

        assert_eq!(service.clear_cache(None).await.unwrap(), 2);
        assert!(service.clear_cache(Some("  ")).await.is_err());
    }

    #[tokio::test]
    async fn test_warm_shape_goes_upstream_even_when_cached() {
        let (service, upstream) = service(CoordinatorConfig::default());
        service.resolve("sessions", "a", QueryOptions::default()).await;
        let warmed = service.warm_shape("sessions", "a", QueryOptions::default()).await;
        assert!(warmed.success);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let (service, _upstream) = service(CoordinatorConfig::default());
        service.start();
        service.start();
        assert!(service.is_running());
        assert!(service.stats().background_tasks_running);
        service.stop();
        service.stop();
        assert!(!service.is_running());
    }
}
