//! Token bucket rate limiting
//!
//! Admission is a pure, non-blocking check: refill by elapsed time, cap at
//! capacity, then try to take `cost` tokens. Denials report how long the
//! caller would have to wait; the limiter itself never waits.

use dashmap::DashMap;
use pulse_cache::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use crate::error::ConfigError;

/// Static shape of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
}

impl BucketConfig {
    pub const fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "bucket capacity must be positive, got {}",
                self.capacity
            )));
        }
        if !(self.refill_per_second.is_finite() && self.refill_per_second >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "bucket refill rate must be non-negative, got {}",
                self.refill_per_second
            )));
        }
        Ok(())
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket template per category
    pub categories: BTreeMap<String, BucketConfig>,
    /// Template for categories with no explicit entry
    pub default_bucket: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert("realtime".to_string(), BucketConfig::new(10.0, 2.0));
        categories.insert("reporting".to_string(), BucketConfig::new(20.0, 1.0));
        Self {
            categories,
            default_bucket: BucketConfig::new(20.0, 1.0),
        }
    }
}

impl RateLimitConfig {
    pub fn with_category(mut self, category: impl Into<String>, bucket: BucketConfig) -> Self {
        self.categories.insert(category.into(), bucket);
        self
    }

    pub fn bucket_for(&self, category: &str) -> BucketConfig {
        self.categories
            .get(category)
            .copied()
            .unwrap_or(self.default_bucket)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_bucket.validate()?;
        for bucket in self.categories.values() {
            bucket.validate()?;
        }
        Ok(())
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    /// Tokens left after the check
    pub remaining: f64,
    /// Set on denial; `None` when the bucket never refills
    pub retry_after_seconds: Option<u64>,
}

impl Admission {
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: SystemTime,
    last_used: SystemTime,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: SystemTime) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_second: config.refill_per_second,
            tokens: config.capacity,
            last_refill: now,
            last_used: now,
        }
    }

    fn level_at(&self, now: SystemTime) -> f64 {
        let elapsed = now
            .duration_since(self.last_refill)
            .unwrap_or_default()
            .as_secs_f64();
        (self.tokens + elapsed * self.refill_per_second).clamp(0.0, self.capacity)
    }

    fn refill(&mut self, now: SystemTime) {
        self.tokens = self.level_at(now);
        // A clock that steps backwards must not rewind the refill origin
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Full again and untouched for at least `idle`; dropping it loses nothing.
    fn is_idle(&self, now: SystemTime, idle: Duration) -> bool {
        self.level_at(now) >= self.capacity
            && now.duration_since(self.last_used).unwrap_or_default() >= idle
    }

    fn try_consume(&mut self, cost: f64, now: SystemTime) -> Admission {
        self.refill(now);
        self.last_used = self.last_used.max(now);

        if self.tokens >= cost {
            self.tokens -= cost;
            return Admission {
                allowed: true,
                remaining: self.tokens,
                retry_after_seconds: None,
            };
        }

        let retry_after_seconds = (self.refill_per_second > 0.0)
            .then(|| ((cost - self.tokens) / self.refill_per_second).ceil() as u64);
        Admission {
            allowed: false,
            remaining: self.tokens,
            retry_after_seconds,
        }
    }
}

/// Point-in-time view of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub category: String,
    pub user: Option<String>,
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_second: f64,
}

/// Per-category token buckets, plus lazily created per-user buckets
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
    user_buckets: DashMap<(String, String), TokenBucket>,
    clock: SharedClock,
    admitted: AtomicU64,
    denied: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            user_buckets: DashMap::new(),
            clock,
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to take `cost` tokens from the category bucket.
    pub fn admit(&self, category: &str, cost: u32) -> Admission {
        let now = self.clock.now();
        let admission = self
            .buckets
            .entry(category.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.bucket_for(category), now))
            .try_consume(f64::from(cost), now);
        self.count(category, None, &admission);
        admission
    }

    /// Same as [`Self::admit`] against the bucket owned by `(category, user)`.
    pub fn admit_for_user(&self, category: &str, user: &str, cost: u32) -> Admission {
        let now = self.clock.now();
        let admission = self
            .user_buckets
            .entry((category.to_string(), user.to_string()))
            .or_insert_with(|| TokenBucket::new(self.config.bucket_for(category), now))
            .try_consume(f64::from(cost), now);
        self.count(category, Some(user), &admission);
        admission
    }

    fn count(&self, category: &str, user: Option<&str>, admission: &Admission) {
        if admission.allowed {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                category,
                user,
                retry_after = admission.retry_after_seconds,
                "Rate limit denied"
            );
        }
    }

    /// Current level of every bucket, refilled to now without mutating it.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let now = self.clock.now();
        let mut out: Vec<BucketSnapshot> = self
            .buckets
            .iter()
            .map(|entry| BucketSnapshot {
                category: entry.key().clone(),
                user: None,
                capacity: entry.capacity,
                tokens: entry.level_at(now),
                refill_per_second: entry.refill_per_second,
            })
            .chain(self.user_buckets.iter().map(|entry| BucketSnapshot {
                category: entry.key().0.clone(),
                user: Some(entry.key().1.clone()),
                capacity: entry.capacity,
                tokens: entry.level_at(now),
                refill_per_second: entry.refill_per_second,
            }))
            .collect();
        out.sort_by(|a, b| (&a.category, &a.user).cmp(&(&b.category, &b.user)));
        out
    }

    /// Admitted and denied counts since construction.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.admitted.load(Ordering::Relaxed),
            self.denied.load(Ordering::Relaxed),
        )
    }

    /// Drop per-user buckets that have refilled and sat unused for `idle`.
    /// Returns how many were removed.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let now = self.clock.now();
        let before = self.user_buckets.len();
        self.user_buckets.retain(|_, bucket| !bucket.is_idle(now, idle));
        let removed = before.saturating_sub(self.user_buckets.len());
        if removed > 0 {
            tracing::debug!(removed, "Idle user buckets swept");
        }
        removed
    }

    /// Drop every bucket; the next admission starts full.
    pub fn reset(&self) {
        self.buckets.clear();
        self.user_buckets.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use pulse_cache::{Clock, ManualClock};
    use std::sync::Arc;

    fn limiter(capacity: f64, rate: f64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let config = RateLimitConfig::default().with_category("test", BucketConfig::new(capacity, rate));
        (RateLimiter::new(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_sixth_call_denied_with_one_second_wait() {
        let (limiter, _clock) = limiter(5.0, 1.0);

        for i in 0..5 {
            let admission = limiter.admit("test", 1);
            assert!(admission.allowed, "call {i} should pass");
        }

        let denied = limiter.admit("test", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, Some(1));
        assert_eq!(limiter.totals(), (5, 1));
    }

    #[test]
    fn test_idle_user_buckets_are_swept() {
        let (limiter, clock) = limiter(5.0, 1.0);
        for user in 0..50 {
            limiter.admit_for_user("test", &format!("user-{user}"), 1);
        }
        limiter.admit("test", 1);
        assert_eq!(limiter.snapshot().len(), 51);

        // Not yet refilled
        assert_eq!(limiter.sweep_idle(Duration::ZERO), 0);

        clock.advance(Duration::from_secs(30));
        limiter.admit_for_user("test", "user-0", 5);
        assert_eq!(limiter.sweep_idle(Duration::from_secs(10)), 49);

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|b| b.user.as_deref() == Some("user-0")));

        // A swept user starts again from a full bucket
        assert!(limiter.admit_for_user("test", "user-7", 5).allowed);
    }

    #[test]
    fn test_refill_over_time() {
        let (limiter, clock) = limiter(5.0, 1.0);
        for _ in 0..5 {
            limiter.admit("test", 1);
        }

        clock.advance(Duration::from_millis(2500));
        assert!(limiter.admit("test", 1).allowed);
        assert!(limiter.admit("test", 1).allowed);
        let third = limiter.admit("test", 1);
        assert!(!third.allowed);
        assert_eq!(third.retry_after_seconds, Some(1));
    }

    #[test]
    fn test_long_idle_caps_at_capacity() {
        let (limiter, clock) = limiter(5.0, 1.0);
        limiter.admit("test", 3);

        clock.advance(Duration::from_secs(86_400));
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!((snapshot[0].tokens - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cost_larger_than_tokens() {
        let (limiter, _clock) = limiter(5.0, 2.0);
        limiter.admit("test", 4);
        let admission = limiter.admit("test", 4);
        assert!(!admission.allowed);
        // (4 - 1) / 2 = 1.5, rounded up
        assert_eq!(admission.retry_after_seconds, Some(2));
        assert!((admission.remaining - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_refill_rate_has_no_hint() {
        let (limiter, _clock) = limiter(1.0, 0.0);
        assert!(limiter.admit("test", 1).allowed);
        let denied = limiter.admit("test", 1);
        assert!(!denied.allowed);
        assert!(denied.retry_after().is_none());
    }

    #[test]
    fn test_unknown_category_uses_default_bucket() {
        let (limiter, _clock) = limiter(5.0, 1.0);
        let admission = limiter.admit("never-configured", 1);
        assert!(admission.allowed);
        assert!((admission.remaining - 19.0).abs() < 1e-9);
    }

    #[test]
    fn test_per_user_buckets_are_independent() {
        let (limiter, _clock) = limiter(2.0, 1.0);

        assert!(limiter.admit_for_user("test", "alice", 2).allowed);
        assert!(!limiter.admit_for_user("test", "alice", 1).allowed);
        assert!(limiter.admit_for_user("test", "bob", 1).allowed);
        assert!(limiter.admit("test", 2).allowed);

        let users: Vec<Option<String>> = limiter.snapshot().into_iter().map(|s| s.user).collect();
        assert_eq!(
            users,
            vec![None, Some("alice".to_string()), Some("bob".to_string())]
        );
    }

    #[test]
    fn test_reset_refills() {
        let (limiter, _clock) = limiter(1.0, 0.0);
        assert!(limiter.admit("test", 1).allowed);
        assert!(!limiter.admit("test", 1).allowed);
        limiter.reset();
        assert!(limiter.admit("test", 1).allowed);
    }

    #[test]
    fn test_clock_stepping_backwards() {
        let (limiter, clock) = limiter(2.0, 1.0);
        limiter.admit("test", 2);
        clock.set(clock.now() - Duration::from_secs(30));
        let admission = limiter.admit("test", 1);
        assert!(!admission.allowed);
        assert!(admission.remaining >= 0.0);
    }

    #[test]
    fn test_invalid_bucket_config() {
        assert!(BucketConfig::new(0.0, 1.0).validate().is_err());
        assert!(BucketConfig::new(5.0, -1.0).validate().is_err());
        assert!(BucketConfig::new(5.0, f64::NAN).validate().is_err());
        assert!(RateLimitConfig::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..50,
            rate in 0.0f64..20.0,
            steps in prop::collection::vec((0u64..120_000, 0u32..8), 1..64),
        ) {
            let (limiter, clock) = limiter(f64::from(capacity), rate);
            for (advance_ms, cost) in steps {
                clock.advance(Duration::from_millis(advance_ms));
                let admission = limiter.admit("test", cost);
                prop_assert!(admission.remaining >= 0.0);
                prop_assert!(admission.remaining <= f64::from(capacity));
                for snapshot in limiter.snapshot() {
                    prop_assert!(snapshot.tokens >= 0.0 && snapshot.tokens <= snapshot.capacity);
                }
            }
        }
    }
}
