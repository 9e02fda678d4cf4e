//! Background cache warming
//!
//! Each cycle turns usage patterns into prioritized warming tasks and runs a
//! bounded number of them concurrently through a [`WarmExecutor`], which in
//! the service is the same gated, deduplicated path real callers use.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use pulse_cache::{RequestKey, SharedClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use crate::config::duration_ms;
use crate::error::{ConfigError, CoordinatorError};
use crate::upstream::AnalyticsQuery;
use crate::usage::{UsagePattern, UsageTracker};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    /// Delay before the first cycle after start
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Shapes requested fewer times than this are never warmed
    pub min_frequency: u64,
    /// Request count at or above which a shape is high priority
    pub high_frequency: u64,
    /// Request count at or above which a shape is medium priority
    pub medium_frequency: u64,
    pub max_concurrent: usize,
    pub max_tasks_per_cycle: usize,
    /// Query variants warmed per qualifying shape
    pub variants_per_shape: usize,
    /// Entries with more TTL left than this are left alone
    #[serde(with = "duration_ms")]
    pub refresh_threshold: Duration,
    /// Data types in importance order; unlisted types sort last
    pub data_type_priority: Vec<String>,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            interval: Duration::from_secs(15 * 60),
            min_frequency: 3,
            high_frequency: 20,
            medium_frequency: 8,
            max_concurrent: 3,
            max_tasks_per_cycle: 20,
            variants_per_shape: 1,
            refresh_threshold: Duration::from_secs(5 * 60),
            data_type_priority: ["realtime", "sessions", "users", "pageviews", "events", "conversions"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl WarmerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_min_frequency(mut self, min_frequency: u64) -> Self {
        self.min_frequency = min_frequency;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_refresh_threshold(mut self, refresh_threshold: Duration) -> Self {
        self.refresh_threshold = refresh_threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("warmer max_concurrent must be positive".to_string()));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid("warmer interval must be positive".to_string()));
        }
        if self.medium_frequency > self.high_frequency {
            return Err(ConfigError::Invalid(
                "warmer medium_frequency must not exceed high_frequency".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// One planned warming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmingTask {
    pub query: AnalyticsQuery,
    pub request_key: RequestKey,
    pub priority: Priority,
    /// Expected requests per warming interval served from the warmed entry
    pub estimated_benefit: f64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

/// Where warming work actually runs
#[async_trait]
pub trait WarmExecutor: Send + Sync {
    /// Time left on a fresh cached entry for `key`, if any.
    async fn remaining_ttl(&self, key: &RequestKey) -> Option<Duration>;

    /// Fetch `query` upstream and write it back to the cache.
    async fn warm(&self, query: &AnalyticsQuery) -> Result<(), CoordinatorError>;
}

/// Outcome of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmCycleReport {
    pub planned: usize,
    pub warmed: usize,
    pub skipped_fresh: usize,
    pub failed: usize,
    pub api_calls_saved: u64,
}

/// Cumulative warmer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmerStats {
    pub cycles: u64,
    pub warmed: u64,
    pub failed: u64,
    pub skipped_fresh: u64,
    pub api_calls_saved: u64,
}

enum TaskOutcome {
    Warmed(u64),
    SkippedFresh,
    Failed,
}

#[derive(Debug)]
pub struct CacheWarmer {
    config: WarmerConfig,
    usage: Arc<UsageTracker>,
    clock: SharedClock,
    cycles: AtomicU64,
    warmed: AtomicU64,
    failed: AtomicU64,
    skipped_fresh: AtomicU64,
    api_calls_saved: AtomicU64,
}

impl CacheWarmer {
    pub fn new(config: WarmerConfig, usage: Arc<UsageTracker>, clock: SharedClock) -> Self {
        Self {
            config,
            usage,
            clock,
            cycles: AtomicU64::new(0),
            warmed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped_fresh: AtomicU64::new(0),
            api_calls_saved: AtomicU64::new(0),
        }
    }

    pub const fn config(&self) -> &WarmerConfig {
        &self.config
    }

    fn priority_for(config: &WarmerConfig, count: u64) -> Priority {
        if count >= config.high_frequency {
            Priority::High
        } else if count >= config.medium_frequency {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    fn importance(config: &WarmerConfig, data_type: &str) -> usize {
        config
            .data_type_priority
            .iter()
            .position(|t| t.eq_ignore_ascii_case(data_type))
            .unwrap_or(usize::MAX)
    }

    /// Requests per warming interval seen for a variant, at least one.
    fn benefit(config: &WarmerConfig, count: u64, first_seen_ms: u64, last_seen_ms: u64) -> f64 {
        let interval_ms = config.interval.as_millis().max(1) as f64;
        let span_ms = (last_seen_ms.saturating_sub(first_seen_ms) as f64).max(interval_ms);
        (count as f64 * interval_ms / span_ms).max(1.0)
    }

    fn tasks_for(config: &WarmerConfig, pattern: &UsagePattern, created_at: u64) -> Vec<WarmingTask> {
        let priority = Self::priority_for(config, pattern.request_count);
        pattern
            .top_variants
            .iter()
            .take(config.variants_per_shape.max(1))
            .map(|variant| WarmingTask {
                query: AnalyticsQuery::new(&pattern.data_type, &pattern.target_id, variant.options.clone()),
                request_key: variant.request_key.clone(),
                priority,
                estimated_benefit: Self::benefit(
                    config,
                    variant.count,
                    variant.first_seen_at,
                    variant.last_seen_at,
                ),
                created_at,
            })
            .collect()
    }

    /// Derive this cycle's tasks from current usage patterns.
    pub fn plan(&self) -> Vec<WarmingTask> {
        let config = &self.config;
        let created_at = self
            .clock
            .now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut tasks: Vec<WarmingTask> = self
            .usage
            .patterns()
            .iter()
            .filter(|p| p.request_count >= config.min_frequency)
            .flat_map(|p| Self::tasks_for(config, p, created_at))
            .collect();

        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| {
                    Self::importance(config, &a.query.data_type)
                        .cmp(&Self::importance(config, &b.query.data_type))
                })
                .then_with(|| b.estimated_benefit.total_cmp(&a.estimated_benefit))
                .then_with(|| a.request_key.cmp(&b.request_key))
        });
        tasks.truncate(config.max_tasks_per_cycle);
        tasks
    }

    /// Plan and execute one warming cycle.
    pub async fn run_cycle(&self, executor: &dyn WarmExecutor) -> WarmCycleReport {
        let config = &self.config;
        let tasks = self.plan();
        let planned = tasks.len();

        let outcomes: Vec<TaskOutcome> = stream::iter(tasks)
            .map(|task| {
                let refresh_threshold = config.refresh_threshold;
                async move {
                    if let Some(remaining) = executor.remaining_ttl(&task.request_key).await
                        && remaining > refresh_threshold
                    {
                        return TaskOutcome::SkippedFresh;
                    }
                    match executor.warm(&task.query).await {
                        Ok(()) => {
                            tracing::debug!(key = %task.request_key, priority = ?task.priority, "Warmed cache entry");
                            TaskOutcome::Warmed(task.estimated_benefit.floor() as u64)
                        }
                        Err(e) => {
                            tracing::warn!(key = %task.request_key, "Warming failed: {}", e);
                            TaskOutcome::Failed
                        }
                    }
                }
            })
            .buffer_unordered(config.max_concurrent.max(1))
            .collect()
            .await;

        let mut report = WarmCycleReport {
            planned,
            ..WarmCycleReport::default()
        };
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Warmed(saved) => {
                    report.warmed += 1;
                    report.api_calls_saved += saved;
                }
                TaskOutcome::SkippedFresh => report.skipped_fresh += 1,
                TaskOutcome::Failed => report.failed += 1,
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.warmed.fetch_add(report.warmed as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        self.skipped_fresh
            .fetch_add(report.skipped_fresh as u64, Ordering::Relaxed);
        self.api_calls_saved
            .fetch_add(report.api_calls_saved, Ordering::Relaxed);

        tracing::info!(
            planned = report.planned,
            warmed = report.warmed,
            skipped_fresh = report.skipped_fresh,
            failed = report.failed,
            "Warming cycle complete"
        );
        report
    }

    pub fn stats(&self) -> WarmerStats {
        WarmerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            warmed: self.warmed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_fresh: self.skipped_fresh.load(Ordering::Relaxed),
            api_calls_saved: self.api_calls_saved.load(Ordering::Relaxed),
        }
    }
}
