//! Cache-first resolution with in-flight request deduplication
//!
//! For one [`RequestKey`] the coordinator:
//!
//! 1. Serves a fresh cached entry if the store has one. Store failures are
//!    logged and read as a miss.
//! 2. Otherwise joins the in-flight request for the key, if any, as a waiter
//!    with a bounded wait and a bounded queue.
//! 3. Otherwise becomes the leader: runs the fetch exactly once, hands the
//!    outcome to every waiter in arrival order, removes the pending record,
//!    writes the value back to the store (best effort) and records a sample.
//!
//! The pending map lock is never held across an await point.

use parking_lot::Mutex;
use pulse_cache::{CacheEntry, CacheError, CacheStore, RequestKey, SharedClock, SourceMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};

use crate::analytics::{PerformanceAnalytics, SampleOutcome};
use crate::config::duration_ms;
use crate::error::{ClassifiedError, ConfigError, CoordinatorError, Result};
use crate::metrics::PulseMetrics;

/// Deduplication and store access limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a waiter waits on an in-flight request
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
    /// Waiters allowed per key
    pub max_waiters: usize,
    /// Bound on every store round trip
    #[serde(with = "duration_ms")]
    pub store_timeout: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(10),
            max_waiters: 100,
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl DedupConfig {
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_max_waiters(mut self, max_waiters: usize) -> Self {
        self.max_waiters = max_waiters;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.wait_timeout.is_zero() {
            return Err(ConfigError::Invalid("wait_timeout must be positive".to_string()));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Invalid("store_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Api,
    Error,
}

/// Per-call cache behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub read: bool,
    pub write: bool,
    pub dedupe: bool,
    /// Marks written entries as produced by the warmer
    pub warmed: bool,
}

impl CachePolicy {
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            read: true,
            write: true,
            dedupe: true,
            warmed: false,
        }
    }

    pub const fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub const fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub const fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub const fn warmed(mut self) -> Self {
        self.warmed = true;
        self
    }
}

/// A successfully resolved value
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub source: Source,
    pub cache_hit: bool,
    /// Served from another caller's in-flight fetch
    pub shared: bool,
    /// Milliseconds since the Unix epoch, for cache hits
    pub cached_at: Option<u64>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub dedup_joins: u64,
    pub waiter_timeouts: u64,
    pub queue_full: u64,
    pub abandoned: u64,
    pub cache_read_failures: u64,
    pub cache_write_failures: u64,
    pub pending: u64,
}

impl CoordinatorStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_failures: AtomicU64,
    dedup_joins: AtomicU64,
    waiter_timeouts: AtomicU64,
    queue_full: AtomicU64,
    abandoned: AtomicU64,
    cache_read_failures: AtomicU64,
    cache_write_failures: AtomicU64,
}

type Outcome = std::result::Result<Value, ClassifiedError>;

#[derive(Debug)]
struct PendingRequest {
    started_at: Instant,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

type PendingMap = Mutex<HashMap<RequestKey, PendingRequest>>;

enum Role {
    Leader,
    Waiter(oneshot::Receiver<Outcome>),
}

/// Removes the pending record if the leader is dropped before settling, which
/// drops every waiter's sender.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    key: &'a RequestKey,
    armed: bool,
}

impl PendingGuard<'_> {
    fn settle(mut self) -> Option<PendingRequest> {
        self.armed = false;
        self.pending.lock().remove(self.key)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.lock().remove(self.key).is_some() {
            tracing::warn!(key = %self.key, "In-flight request abandoned by its leader");
        }
    }
}

/// Central cache and deduplication orchestrator
pub struct RequestCoordinator {
    store: Arc<dyn CacheStore>,
    config: DedupConfig,
    pending: PendingMap,
    clock: SharedClock,
    analytics: Option<Arc<PerformanceAnalytics>>,
    metrics: Option<Arc<PulseMetrics>>,
    counters: Counters,
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("store", &self.store.backend_name())
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl RequestCoordinator {
    pub fn new(store: Arc<dyn CacheStore>, config: DedupConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            pending: Mutex::new(HashMap::new()),
            clock,
            analytics: None,
            metrics: None,
            counters: Counters::default(),
        }
    }

    pub fn with_analytics(mut self, analytics: Arc<PerformanceAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PulseMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Resolve `key`, calling `fetch` only if the cache misses and no other
    /// caller is already fetching the same key.
    pub async fn resolve<F, Fut>(&self, key: &RequestKey, policy: &CachePolicy, fetch: F) -> Result<Resolved>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let started = Instant::now();
        let shape = key.data_type().unwrap_or("unknown").to_string();

        if policy.read
            && let Some(entry) = self.read_fresh(key).await
        {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.cache_hits.inc();
            }
            let elapsed = started.elapsed();
            self.sample(&shape, elapsed, SampleOutcome::Hit);
            tracing::debug!(key = %key, "Cache hit");
            return Ok(Resolved {
                value: entry.payload,
                source: Source::Cache,
                cache_hit: true,
                shared: false,
                cached_at: Some(entry.cached_at),
                elapsed,
            });
        }

        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.cache_misses.inc();
        }

        if !policy.dedupe {
            return self.fetch_direct(key, policy, fetch, started, &shape).await;
        }

        match self.join_or_lead(key)? {
            Role::Waiter(receiver) => self.wait(key, receiver, started, &shape).await,
            Role::Leader => self.lead(key, policy, fetch, started, &shape).await,
        }
    }

    /// Fetch and write back regardless of what the cache holds. Still deduplicated.
    pub async fn refresh<F, Fut>(&self, key: &RequestKey, policy: &CachePolicy, fetch: F) -> Result<Resolved>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let policy = policy.clone().with_read(false);
        self.resolve(key, &policy, fetch).await
    }

    fn join_or_lead(&self, key: &RequestKey) -> Result<Role> {
        let mut pending = self.pending.lock();
        if let Some(request) = pending.get_mut(key) {
            if request.waiters.len() >= self.config.max_waiters {
                drop(pending);
                self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, limit = self.config.max_waiters, "Waiter queue full");
                return Err(CoordinatorError::QueueFull {
                    key: key.clone(),
                    limit: self.config.max_waiters,
                });
            }
            let (sender, receiver) = oneshot::channel();
            request.waiters.push(sender);
            let queued = request.waiters.len();
            let in_flight = request.started_at.elapsed();
            drop(pending);

            self.counters.dedup_joins.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.dedup_joins.inc();
            }
            tracing::debug!(key = %key, queued, in_flight_ms = in_flight.as_millis() as u64, "Joined in-flight request");
            return Ok(Role::Waiter(receiver));
        }

        pending.insert(
            key.clone(),
            PendingRequest {
                started_at: Instant::now(),
                waiters: Vec::new(),
            },
        );
        Ok(Role::Leader)
    }

    async fn wait(
        &self,
        key: &RequestKey,
        receiver: oneshot::Receiver<Outcome>,
        started: Instant,
        shape: &str,
    ) -> Result<Resolved> {
        match timeout(self.config.wait_timeout, receiver).await {
            Ok(Ok(Ok(value))) => {
                let elapsed = started.elapsed();
                self.sample(shape, elapsed, SampleOutcome::Miss);
                Ok(Resolved {
                    value,
                    source: Source::Api,
                    cache_hit: false,
                    shared: true,
                    cached_at: None,
                    elapsed,
                })
            }
            Ok(Ok(Err(error))) => Err(error.into()),
            Ok(Err(_)) => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                Err(CoordinatorError::Abandoned { key: key.clone() })
            }
            Err(_) => {
                self.counters.waiter_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, waited = ?self.config.wait_timeout, "Gave up waiting on in-flight request");
                Err(CoordinatorError::WaitTimeout {
                    key: key.clone(),
                    waited: self.config.wait_timeout,
                })
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        key: &RequestKey,
        policy: &CachePolicy,
        fetch: F,
        started: Instant,
        shape: &str,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let guard = PendingGuard {
            pending: &self.pending,
            key,
            armed: true,
        };

        self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.upstream_calls.inc();
        }
        let outcome = fetch().await;
        let fetch_time = started.elapsed();

        let waiters = guard.settle().map(|p| p.waiters).unwrap_or_default();
        if !waiters.is_empty() {
            tracing::debug!(key = %key, waiters = waiters.len(), "Releasing waiters");
        }
        for waiter in waiters {
            // A waiter that timed out has dropped its receiver
            let _ = waiter.send(outcome.clone());
        }

        match outcome {
            Ok(value) => {
                if policy.write {
                    self.write_back(key, &value, policy, fetch_time).await;
                }
                let elapsed = started.elapsed();
                self.sample(shape, elapsed, SampleOutcome::Miss);
                Ok(Resolved {
                    value,
                    source: Source::Api,
                    cache_hit: false,
                    shared: false,
                    cached_at: None,
                    elapsed,
                })
            }
            Err(error) => {
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
                self.sample(shape, started.elapsed(), SampleOutcome::Error);
                Err(error.into())
            }
        }
    }

    async fn fetch_direct<F, Fut>(
        &self,
        key: &RequestKey,
        policy: &CachePolicy,
        fetch: F,
        started: Instant,
        shape: &str,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.upstream_calls.inc();
        }
        match fetch().await {
            Ok(value) => {
                if policy.write {
                    self.write_back(key, &value, policy, started.elapsed()).await;
                }
                let elapsed = started.elapsed();
                self.sample(shape, elapsed, SampleOutcome::Miss);
                Ok(Resolved {
                    value,
                    source: Source::Api,
                    cache_hit: false,
                    shared: false,
                    cached_at: None,
                    elapsed,
                })
            }
            Err(error) => {
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
                self.sample(shape, started.elapsed(), SampleOutcome::Error);
                Err(error.into())
            }
        }
    }

    async fn read_fresh(&self, key: &RequestKey) -> Option<CacheEntry> {
        let raw = match timeout(self.config.store_timeout, self.store.get(key.as_str())).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                self.counters.cache_read_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Cache read failed, treating as miss: {}", e);
                return None;
            }
            Err(_) => {
                self.counters.cache_read_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, timeout = ?self.config.store_timeout, "Cache read timed out, treating as miss");
                return None;
            }
        };

        match CacheEntry::from_bytes(&raw) {
            Ok(entry) if entry.is_fresh(self.clock.now()) => Some(entry),
            Ok(_) => None,
            Err(e) => {
                self.counters.cache_read_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Discarding undecodable cache entry: {}", e);
                None
            }
        }
    }

    async fn write_back(&self, key: &RequestKey, value: &Value, policy: &CachePolicy, fetch_time: Duration) {
        let metadata = SourceMetadata {
            data_type: key.data_type().unwrap_or_default().to_string(),
            target_id: key.target_id().unwrap_or_default().to_string(),
            fetch_millis: fetch_time.as_millis() as u64,
            warmed: policy.warmed,
        };
        let entry = CacheEntry::new(key.clone(), value.clone(), self.clock.now(), policy.ttl, metadata);

        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.counters.cache_write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Cache entry encoding failed: {}", e);
                return;
            }
        };

        match timeout(self.config.store_timeout, self.store.set(key.as_str(), bytes, policy.ttl)).await {
            Ok(Ok(true)) => tracing::debug!(key = %key, ttl = ?policy.ttl, "Cached upstream result"),
            Ok(Ok(false)) => {
                self.counters.cache_write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Cache store declined write");
            }
            Ok(Err(e)) => {
                self.counters.cache_write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Cache write failed, continuing: {}", e);
            }
            Err(_) => {
                self.counters.cache_write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Cache write timed out, continuing");
            }
        }
    }

    fn sample(&self, shape: &str, latency: Duration, outcome: SampleOutcome) {
        if let Some(analytics) = &self.analytics {
            analytics.record(shape, latency, outcome);
        }
        if let Some(metrics) = &self.metrics {
            metrics.request_latency.observe(latency.as_secs_f64());
        }
    }

    /// Time left on a fresh cached entry, `None` if absent, stale or unreadable.
    pub async fn remaining_ttl(&self, key: &RequestKey) -> Option<Duration> {
        let entry = self.read_fresh(key).await?;
        Some(entry.remaining_ttl(self.clock.now()))
    }

    /// Delete every key matching a glob pattern. Returns how many were removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> std::result::Result<usize, CacheError> {
        let keys = timeout(self.config.store_timeout, self.store.scan(pattern))
            .await
            .map_err(|_| CacheError::Timeout(self.config.store_timeout))??;

        let mut removed = 0;
        for key in keys {
            match timeout(self.config.store_timeout, self.store.del(&key)).await {
                Ok(Ok(true)) => removed += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(CacheError::Timeout(self.config.store_timeout)),
            }
        }
        tracing::info!(pattern, removed, "Invalidated cache entries");
        Ok(removed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.counters;
        CoordinatorStats {
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            upstream_calls: c.upstream_calls.load(Ordering::Relaxed),
            upstream_failures: c.upstream_failures.load(Ordering::Relaxed),
            dedup_joins: c.dedup_joins.load(Ordering::Relaxed),
            waiter_timeouts: c.waiter_timeouts.load(Ordering::Relaxed),
            queue_full: c.queue_full.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            cache_read_failures: c.cache_read_failures.load(Ordering::Relaxed),
            cache_write_failures: c.cache_write_failures.load(Ordering::Relaxed),
            pending: self.pending_count() as u64,
        }
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }
}
