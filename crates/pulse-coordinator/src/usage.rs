//! Usage pattern aggregation
//!
//! Every completed request is folded into the pattern of its request shape
//! (data type plus target). Patterns remember how often each concrete query
//! variant, dimension set and date range was asked for, which is what the
//! warmer needs to re-issue the most valuable queries.

use dashmap::DashMap;
use pulse_cache::{DateRange, QueryOptions, RequestKey, SharedClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::upstream::AnalyticsQuery;

/// How many entries of each "top" list a pattern reports
const TOP_N: usize = 5;

/// Distinct dimension sets, date ranges or variants remembered per shape
const MAX_TRACKED: usize = 64;

/// One concrete query seen for a shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryVariant {
    pub request_key: RequestKey,
    pub options: QueryOptions,
    pub count: u64,
    /// Milliseconds since the Unix epoch
    pub first_seen_at: u64,
    pub last_seen_at: u64,
}

/// Aggregate usage of one request shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePattern {
    pub request_shape: String,
    pub data_type: String,
    pub target_id: String,
    pub request_count: u64,
    pub top_dimension_sets: Vec<(Vec<String>, u64)>,
    pub top_date_ranges: Vec<(DateRange, u64)>,
    pub top_variants: Vec<QueryVariant>,
    pub last_seen_at: u64,
}

#[derive(Debug)]
struct ShapeUsage {
    data_type: String,
    target_id: String,
    request_count: u64,
    dimension_sets: HashMap<Vec<String>, Tally>,
    date_ranges: HashMap<DateRange, Tally>,
    variants: HashMap<RequestKey, QueryVariant>,
    last_seen: SystemTime,
}

#[derive(Debug, Clone, Copy)]
struct Tally {
    count: u64,
    last_seen: SystemTime,
}

impl Tally {
    fn bump<K: Clone + Eq + std::hash::Hash>(counts: &mut HashMap<K, Self>, key: K, now: SystemTime) {
        let tally = counts.entry(key).or_insert(Self {
            count: 0,
            last_seen: now,
        });
        tally.count += 1;
        tally.last_seen = now;
        if counts.len() > MAX_TRACKED {
            evict_oldest(counts, |t| t.last_seen);
        }
    }
}

/// Remove the entry whose `seen` value is oldest.
fn evict_oldest<K: Clone + Eq + std::hash::Hash, V, T: Ord>(map: &mut HashMap<K, V>, seen: impl Fn(&V) -> T) {
    let oldest = map
        .iter()
        .min_by_key(|(_, v)| seen(v))
        .map(|(k, _)| k.clone());
    if let Some(key) = oldest {
        map.remove(&key);
    }
}

fn millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn top<K: Clone + Ord>(counts: &HashMap<K, Tally>) -> Vec<(K, u64)> {
    let mut entries: Vec<(K, u64)> = counts.iter().map(|(k, t)| (k.clone(), t.count)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_N);
    entries
}

impl ShapeUsage {
    fn to_pattern(&self, request_shape: &str) -> UsagePattern {
        let mut variants: Vec<QueryVariant> = self.variants.values().cloned().collect();
        variants.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.request_key.cmp(&b.request_key))
        });
        variants.truncate(TOP_N);

        let mut date_ranges: Vec<(DateRange, u64)> =
            self.date_ranges.iter().map(|(k, t)| (k.clone(), t.count)).collect();
        date_ranges.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
        date_ranges.truncate(TOP_N);

        UsagePattern {
            request_shape: request_shape.to_string(),
            data_type: self.data_type.clone(),
            target_id: self.target_id.clone(),
            request_count: self.request_count,
            top_dimension_sets: top(&self.dimension_sets),
            top_date_ranges: date_ranges,
            top_variants: variants,
            last_seen_at: millis(self.last_seen),
        }
    }
}

/// Continuously updated usage aggregates keyed by request shape
#[derive(Debug)]
pub struct UsageTracker {
    shapes: DashMap<String, ShapeUsage>,
    clock: SharedClock,
}

impl UsageTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            shapes: DashMap::new(),
            clock,
        }
    }

    pub fn shape_of(data_type: &str, target_id: &str) -> String {
        format!("{}:{}", data_type.trim().to_lowercase(), target_id.trim())
    }

    /// Fold one completed request into its shape's pattern.
    pub fn record(&self, query: &AnalyticsQuery) {
        let now = self.clock.now();
        let now_ms = millis(now);
        let shape = Self::shape_of(&query.data_type, &query.target_id);

        let mut usage = self.shapes.entry(shape).or_insert_with(|| ShapeUsage {
            data_type: query.data_type.trim().to_lowercase(),
            target_id: query.target_id.trim().to_string(),
            request_count: 0,
            dimension_sets: HashMap::new(),
            date_ranges: HashMap::new(),
            variants: HashMap::new(),
            last_seen: now,
        });

        usage.request_count += 1;
        usage.last_seen = now;
        Tally::bump(&mut usage.dimension_sets, query.options.normalized_dimensions(), now);
        Tally::bump(&mut usage.date_ranges, query.options.effective_date_range(), now);

        let variant = usage
            .variants
            .entry(query.request_key.clone())
            .or_insert_with(|| QueryVariant {
                request_key: query.request_key.clone(),
                options: query.options.clone(),
                count: 0,
                first_seen_at: now_ms,
                last_seen_at: now_ms,
            });
        variant.count += 1;
        variant.last_seen_at = now_ms;
        if usage.variants.len() > MAX_TRACKED {
            evict_oldest(&mut usage.variants, |v| v.last_seen_at);
        }
    }

    /// All patterns, most requested first.
    pub fn patterns(&self) -> Vec<UsagePattern> {
        let mut patterns: Vec<UsagePattern> = self
            .shapes
            .iter()
            .map(|entry| entry.value().to_pattern(entry.key()))
            .collect();
        patterns.sort_by(|a, b| {
            b.request_count
                .cmp(&a.request_count)
                .then_with(|| a.request_shape.cmp(&b.request_shape))
        });
        patterns
    }

    /// Drop shapes not seen within `retention`, and the stale dimension sets,
    /// date ranges and variants of the shapes that remain. Returns how many
    /// shapes were dropped.
    pub fn decay(&self, retention: Duration) -> usize {
        let Some(cutoff) = self.clock.now().checked_sub(retention) else {
            return 0;
        };
        let cutoff_ms = millis(cutoff);
        let before = self.shapes.len();
        self.shapes.retain(|_, usage| {
            if usage.last_seen < cutoff {
                return false;
            }
            usage.dimension_sets.retain(|_, t| t.last_seen >= cutoff);
            usage.date_ranges.retain(|_, t| t.last_seen >= cutoff);
            usage.variants.retain(|_, v| v.last_seen_at >= cutoff_ms);
            true
        });
        let dropped = before.saturating_sub(self.shapes.len());
        if dropped > 0 {
            tracing::debug!(dropped, "Decayed stale usage patterns");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn clear(&self) {
        self.shapes.clear();
    }
}
