//! Performance analytics and optimization recommendations
//!
//! Samples are accumulated per request shape. A rollup turns them into a
//! [`PerformanceReport`] with a 0-100 score and severity-ordered
//! recommendations. Recommendations are advisory; they only change anything
//! through registered [`AutoApply`] hooks, and only when auto-apply is enabled.

use dashmap::DashMap;
use parking_lot::RwLock;
use pulse_cache::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use crate::config::{OptimizationFlags, duration_ms};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    #[serde(with = "duration_ms")]
    pub rollup_interval: Duration,
    /// Latencies kept per shape for percentile estimates
    pub sample_window: usize,
    /// Average latency above which a shape is reported as slow
    #[serde(with = "duration_ms")]
    pub slow_threshold: Duration,
    /// Average latency that still earns a full latency score
    #[serde(with = "duration_ms")]
    pub good_latency: Duration,
    /// Hit rate below which warming is recommended
    pub low_hit_rate: f64,
    /// Error rate above which errors are flagged
    pub high_error_rate: f64,
    /// Below this many requests no recommendations are made
    pub min_requests: u64,
    /// Let registered hooks act on recommendations
    pub auto_apply: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            rollup_interval: Duration::from_secs(5 * 60),
            sample_window: 100,
            slow_threshold: Duration::from_secs(2),
            good_latency: Duration::from_millis(500),
            low_hit_rate: 0.7,
            high_error_rate: 0.05,
            min_requests: 10,
            auto_apply: false,
        }
    }
}

impl AnalyticsConfig {
    pub fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    pub fn with_min_requests(mut self, min_requests: u64) -> Self {
        self.min_requests = min_requests;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_window == 0 {
            return Err(ConfigError::Invalid("sample_window must be positive".to_string()));
        }
        if self.good_latency >= self.slow_threshold * 2 {
            return Err(ConfigError::Invalid(
                "good_latency must be below twice the slow threshold".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.low_hit_rate) || !(0.0..=1.0).contains(&self.high_error_rate) {
            return Err(ConfigError::Invalid("rates must lie in [0, 1]".to_string()));
        }
        Ok(())
    }
}

/// How one request was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOutcome {
    /// Served from the cache
    Hit,
    /// Fetched upstream, or shared from another caller's in-flight fetch
    Miss,
    Error,
}

#[derive(Debug, Default)]
struct ShapeMetrics {
    count: u64,
    average_ms: f64,
    hits: u64,
    misses: u64,
    errors: u64,
    recent: VecDeque<Duration>,
}

impl ShapeMetrics {
    fn record(&mut self, latency: Duration, outcome: SampleOutcome, window: usize) {
        self.count += 1;
        let ms = latency.as_secs_f64() * 1000.0;
        self.average_ms += (ms - self.average_ms) / self.count as f64;
        match outcome {
            SampleOutcome::Hit => self.hits += 1,
            SampleOutcome::Miss => self.misses += 1,
            SampleOutcome::Error => self.errors += 1,
        }
        self.recent.push_back(latency);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
    }
}

/// Nearest-rank percentile of sorted samples, in milliseconds.
fn percentile_ms(sorted: &[Duration], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index].as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeReport {
    pub shape: String,
    pub count: u64,
    pub average_latency_ms: f64,
    pub median_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub hit_rate: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    EnableWarming,
    EnableBatching,
    InvestigateErrors,
    OptimizeSlowQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub kind: RecommendationKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub total_requests: u64,
    pub hit_rate: f64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub score: f64,
    pub slow_operations: Vec<String>,
    pub shapes: Vec<ShapeReport>,
    pub recommendations: Vec<Recommendation>,
    /// Milliseconds since the Unix epoch
    pub generated_at: u64,
}

/// Opt-in hook that acts on recommendations during rollups
pub trait AutoApply: Send + Sync {
    fn apply(&self, recommendation: &Recommendation);
}

/// Toggles [`OptimizationFlags`] in response to recommendations
#[derive(Debug, Clone)]
pub struct FlagAutoApply {
    flags: Arc<RwLock<OptimizationFlags>>,
}

impl FlagAutoApply {
    pub const fn new(flags: Arc<RwLock<OptimizationFlags>>) -> Self {
        Self { flags }
    }
}

impl AutoApply for FlagAutoApply {
    fn apply(&self, recommendation: &Recommendation) {
        let mut flags = self.flags.write();
        match recommendation.kind {
            RecommendationKind::EnableWarming if !flags.warming => {
                flags.warming = true;
                tracing::info!("Auto-apply: enabled cache warming");
            }
            RecommendationKind::EnableBatching if !flags.batching => {
                flags.batching = true;
                tracing::info!("Auto-apply: enabled parallel batching");
            }
            _ => {}
        }
    }
}

/// Per-shape latency, hit and error accounting
pub struct PerformanceAnalytics {
    config: AnalyticsConfig,
    shapes: DashMap<String, ShapeMetrics>,
    hooks: RwLock<Vec<Arc<dyn AutoApply>>>,
    last_report: RwLock<Option<PerformanceReport>>,
    clock: SharedClock,
}

impl std::fmt::Debug for PerformanceAnalytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceAnalytics")
            .field("config", &self.config)
            .field("shapes", &self.shapes.len())
            .field("hooks", &self.hooks.read().len())
            .finish_non_exhaustive()
    }
}

impl PerformanceAnalytics {
    pub fn new(config: AnalyticsConfig, clock: SharedClock) -> Self {
        Self {
            config,
            shapes: DashMap::new(),
            hooks: RwLock::new(Vec::new()),
            last_report: RwLock::new(None),
            clock,
        }
    }

    pub const fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub fn add_auto_apply(&self, hook: Arc<dyn AutoApply>) {
        self.hooks.write().push(hook);
    }

    pub fn record(&self, shape: &str, latency: Duration, outcome: SampleOutcome) {
        self.shapes
            .entry(shape.to_string())
            .or_default()
            .record(latency, outcome, self.config.sample_window);
    }

    /// 40% hit rate, 40% error-free rate, 20% latency. 100 with no traffic.
    pub fn score(&self, hit_rate: f64, error_rate: f64, average_latency: Duration, total: u64) -> f64 {
        if total == 0 {
            return 100.0;
        }
        let good = self.config.good_latency.as_secs_f64();
        let worst = (self.config.slow_threshold * 2).as_secs_f64();
        let avg = average_latency.as_secs_f64();
        let latency_score = if avg <= good {
            1.0
        } else if avg >= worst {
            0.0
        } else {
            1.0 - (avg - good) / (worst - good)
        };
        let score = 40.0 * hit_rate + 40.0 * (1.0 - error_rate) + 20.0 * latency_score;
        score.clamp(0.0, 100.0)
    }

    /// Compute a report from the current samples without side effects.
    pub fn report(&self) -> PerformanceReport {
        let slow_ms = self.config.slow_threshold.as_secs_f64() * 1000.0;
        let mut shapes = Vec::with_capacity(self.shapes.len());
        let mut all_recent = Vec::new();
        let (mut total, mut hits, mut errors, mut weighted_ms) = (0u64, 0u64, 0u64, 0.0f64);

        for entry in &self.shapes {
            let m = entry.value();
            let mut sorted: Vec<Duration> = m.recent.iter().copied().collect();
            sorted.sort();
            all_recent.extend_from_slice(&sorted);

            total += m.count;
            hits += m.hits;
            errors += m.errors;
            weighted_ms += m.average_ms * m.count as f64;

            let count = m.count.max(1) as f64;
            shapes.push(ShapeReport {
                shape: entry.key().clone(),
                count: m.count,
                average_latency_ms: m.average_ms,
                median_latency_ms: percentile_ms(&sorted, 0.5),
                p95_latency_ms: percentile_ms(&sorted, 0.95),
                hit_rate: m.hits as f64 / count,
                error_rate: m.errors as f64 / count,
            });
        }
        shapes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.shape.cmp(&b.shape)));
        all_recent.sort();

        let denom = total.max(1) as f64;
        let hit_rate = hits as f64 / denom;
        let error_rate = errors as f64 / denom;
        let average_latency_ms = weighted_ms / denom;
        let slow_operations: Vec<String> = shapes
            .iter()
            .filter(|s| s.average_latency_ms > slow_ms)
            .map(|s| s.shape.clone())
            .collect();

        let score = self.score(
            hit_rate,
            error_rate,
            Duration::from_secs_f64(average_latency_ms / 1000.0),
            total,
        );
        let recommendations =
            self.recommend(total, hit_rate, error_rate, average_latency_ms, &slow_operations);

        PerformanceReport {
            total_requests: total,
            hit_rate,
            error_rate,
            average_latency_ms,
            p95_latency_ms: percentile_ms(&all_recent, 0.95),
            score,
            slow_operations,
            shapes,
            recommendations,
            generated_at: self
                .clock
                .now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    fn recommend(
        &self,
        total: u64,
        hit_rate: f64,
        error_rate: f64,
        average_latency_ms: f64,
        slow_operations: &[String],
    ) -> Vec<Recommendation> {
        if total < self.config.min_requests {
            return Vec::new();
        }
        let mut out = Vec::new();

        if error_rate > self.config.high_error_rate {
            out.push(Recommendation {
                severity: Severity::Critical,
                kind: RecommendationKind::InvestigateErrors,
                message: format!(
                    "error rate {:.1}% above {:.1}%: check upstream health and credentials",
                    error_rate * 100.0,
                    self.config.high_error_rate * 100.0
                ),
                shape: None,
            });
        }
        if hit_rate < self.config.low_hit_rate {
            let severity = if hit_rate < self.config.low_hit_rate / 2.0 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            out.push(Recommendation {
                severity,
                kind: RecommendationKind::EnableWarming,
                message: format!(
                    "hit rate {:.1}% below {:.0}%: enable cache warming",
                    hit_rate * 100.0,
                    self.config.low_hit_rate * 100.0
                ),
                shape: None,
            });
        }
        let slow_ms = self.config.slow_threshold.as_secs_f64() * 1000.0;
        if average_latency_ms > slow_ms {
            out.push(Recommendation {
                severity: Severity::Warning,
                kind: RecommendationKind::EnableBatching,
                message: format!(
                    "average latency {average_latency_ms:.0}ms above {slow_ms:.0}ms: enable batching"
                ),
                shape: None,
            });
        }
        for shape in slow_operations {
            out.push(Recommendation {
                severity: Severity::Info,
                kind: RecommendationKind::OptimizeSlowQuery,
                message: format!("{shape} averages above {slow_ms:.0}ms: narrow its dimensions or date range"),
                shape: Some(shape.clone()),
            });
        }

        out.sort_by_key(|r| r.severity);
        out
    }

    /// Periodic rollup: compute, store, log and hand recommendations to hooks.
    pub fn rollup(&self) -> PerformanceReport {
        let report = self.report();
        tracing::info!(
            total = report.total_requests,
            hit_rate = report.hit_rate,
            error_rate = report.error_rate,
            score = report.score,
            "Performance rollup"
        );
        for rec in &report.recommendations {
            tracing::debug!(severity = ?rec.severity, kind = ?rec.kind, "{}", rec.message);
        }

        if self.config.auto_apply {
            let hooks = self.hooks.read().clone();
            for rec in &report.recommendations {
                for hook in &hooks {
                    hook.apply(rec);
                }
            }
        }

        *self.last_report.write() = Some(report.clone());
        report
    }

    pub fn last_report(&self) -> Option<PerformanceReport> {
        self.last_report.read().clone()
    }

    pub fn reset(&self) {
        self.shapes.clear();
        *self.last_report.write() = None;
    }
}
