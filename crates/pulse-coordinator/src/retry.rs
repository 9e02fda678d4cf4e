//! Retry with exponential backoff and jitter
//!
//! Each failed attempt is classified once. Non-retryable kinds surface
//! immediately; retryable kinds wait either the provider's own hint or
//! `min(max_delay, base_delay * multiplier^(attempt-1))` scaled by a random
//! factor in `[0.5, 1.5]` and clamped back under that ceiling.

use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::classify::classify;
use crate::config::duration_ms;
use crate::error::{ClassifiedError, ConfigError, RawError};
use crate::metrics::PulseMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`
    pub max_retries: u32,

    /// Delay ceiling for the first retry
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Upper bound for any computed delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add jitter to prevent synchronized retry storms
    pub jitter: bool,

    /// Provider wait hints longer than this are not waited out; the error surfaces instead
    #[serde(with = "duration_ms")]
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// Latency-sensitive queries: few, quick retries.
    pub fn realtime() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
            max_retry_after: Duration::from_secs(2),
        }
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            max_retry_after: Duration::from_secs(30),
        }
    }

    /// Quota-sensitive queries: fewer upstream hits, longer waits.
    pub fn quota_sensitive() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 3.0,
            jitter: true,
            max_retry_after: Duration::from_secs(120),
        }
    }

    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Self::standard()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Override fields from `{prefix}_MAX_RETRIES`, `{prefix}_BASE_DELAY_MS`,
    /// `{prefix}_MAX_DELAY_MS`, `{prefix}_BACKOFF_MULTIPLIER` and `{prefix}_JITTER`.
    pub fn from_env(prefix: &str, defaults: Self) -> Self {
        let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok();
        Self {
            max_retries: var("MAX_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            base_delay: var("BASE_DELAY_MS")
                .and_then(|s| s.parse().ok())
                .map_or(defaults.base_delay, Duration::from_millis),
            max_delay: var("MAX_DELAY_MS")
                .and_then(|s| s.parse().ok())
                .map_or(defaults.max_delay, Duration::from_millis),
            multiplier: var("BACKOFF_MULTIPLIER")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.multiplier),
            jitter: var("JITTER")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.jitter),
            max_retry_after: defaults.max_retry_after,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid(
                "base_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic ceiling for the delay after failed attempt `attempt` (1-based).
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay after failed attempt `attempt`, jitter applied.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let factor: f64 = rng().random_range(0.5..=1.5);
        ceiling.mul_f64(factor).min(ceiling)
    }
}

/// Cumulative retry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub non_retryable: u64,
}

/// Executes operations under one [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryManager {
    name: String,
    policy: RetryPolicy,
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    non_retryable: AtomicU64,
    metrics: Option<Arc<PulseMetrics>>,
}

impl RetryManager {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            non_retryable: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PulseMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.policy.backoff_delay(attempt)
    }

    /// Wait before the next attempt, or `None` if the error's own hint is too long to wait out.
    pub fn delay_for(&self, attempt: u32, error: &ClassifiedError) -> Option<Duration> {
        match error.retry_after() {
            Some(hint) if hint > self.policy.max_retry_after => None,
            Some(hint) => Some(hint),
            None => Some(self.policy.backoff_delay(attempt)),
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// `max_retries + 1` attempts have been made.
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let raw = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(profile = %self.name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(raw) => raw,
            };

            let error = classify(raw.as_ref());

            if !error.is_retryable() {
                self.non_retryable.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(profile = %self.name, kind = %error.kind(), "Non-retryable failure: {}", error);
                return Err(error);
            }

            if attempt > self.policy.max_retries {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    profile = %self.name,
                    attempts = attempt,
                    kind = %error.kind(),
                    "Retries exhausted: {}",
                    error
                );
                return Err(error);
            }

            let Some(delay) = self.delay_for(attempt, &error) else {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    profile = %self.name,
                    hint = ?error.retry_after(),
                    "Provider wait hint exceeds retry budget, giving up: {}",
                    error
                );
                return Err(error);
            };

            self.retries.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.retries.inc();
            }
            tracing::warn!(
                profile = %self.name,
                attempt,
                kind = %error.kind(),
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying: {}",
                error
            );

            tokio::time::sleep(delay).await;
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            non_retryable: self.non_retryable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::significant_drop_tightening
)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::upstream::UpstreamFailure;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(10))
            .without_jitter()
    }

    #[test]
    fn test_profiles_differ() {
        assert!(RetryPolicy::realtime().base_delay < RetryPolicy::standard().base_delay);
        assert!(RetryPolicy::quota_sensitive().max_delay > RetryPolicy::standard().max_delay);
        for policy in [
            RetryPolicy::realtime(),
            RetryPolicy::standard(),
            RetryPolicy::quota_sensitive(),
        ] {
            assert!(policy.validate().is_ok());
        }
    }

    #[test]
    fn test_invalid_policy() {
        let mut policy = RetryPolicy::standard();
        policy.multiplier = 0.5;
        assert!(policy.validate().is_err());

        let policy = RetryPolicy::new(1, Duration::from_secs(5), Duration::from_secs(1));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_delay_ceiling_progression() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.delay_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.delay_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.delay_ceiling(3), Duration::from_millis(400));
        assert_eq!(policy.delay_ceiling(4), Duration::from_millis(800));
        assert_eq!(policy.delay_ceiling(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_ceiling(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jittered_delay_stays_under_ceiling() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(1000));
        for attempt in 1..=4 {
            let ceiling = policy.delay_ceiling(attempt);
            for _ in 0..200 {
                let delay = policy.backoff_delay(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling / 2 - Duration::from_micros(1));
            }
        }
    }

    #[test]
    fn test_from_env_overrides() {
        unsafe {
            std::env::set_var("PULSE_TEST_RETRY_MAX_RETRIES", "7");
            std::env::set_var("PULSE_TEST_RETRY_BASE_DELAY_MS", "250");
            std::env::set_var("PULSE_TEST_RETRY_JITTER", "false");
        }

        let policy = RetryPolicy::from_env("PULSE_TEST_RETRY", RetryPolicy::standard());
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, RetryPolicy::standard().max_delay);
        assert!(!policy.jitter);

        unsafe {
            std::env::remove_var("PULSE_TEST_RETRY_MAX_RETRIES");
            std::env::remove_var("PULSE_TEST_RETRY_BASE_DELAY_MS");
            std::env::remove_var("PULSE_TEST_RETRY_JITTER");
        }
    }

    #[tokio::test]
    async fn test_success_on_first_try() {
        let manager = RetryManager::new("test", fast_policy(3));
        let calls = Mutex::new(0);

        let result = manager
            .execute_with_retry(|| async {
                *calls.lock() += 1;
                Ok::<_, RawError>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.lock(), 1);
        assert_eq!(manager.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_makes_max_retries_plus_one_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(1000));
        let manager = RetryManager::new("test", policy.clone());
        let stamps: Mutex<Vec<Instant>> = Mutex::new(Vec::new());

        let result = manager
            .execute_with_retry(|| async {
                stamps.lock().push(Instant::now());
                Err::<(), RawError>(UpstreamFailure::boxed("read ECONNRESET"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);

        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 4);
        for (i, pair) in stamps.windows(2).enumerate() {
            let waited = pair[1] - pair[0];
            let ceiling = policy.delay_ceiling(i as u32 + 1);
            assert!(waited <= ceiling, "delay {waited:?} above {ceiling:?}");
        }

        let stats = manager.stats();
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let manager = RetryManager::new("test", fast_policy(3));
        let calls = Mutex::new(0);

        let result = manager
            .execute_with_retry(|| async {
                let mut count = calls.lock();
                *count += 1;
                if *count < 3 {
                    Err(UpstreamFailure::boxed("socket hang up"))
                } else {
                    Ok(serde_json::json!({"rows": 3}))
                }
            })
            .await;

        assert_eq!(result.unwrap(), serde_json::json!({"rows": 3}));
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let manager = RetryManager::new("test", fast_policy(5));
        let calls = Mutex::new(0);

        let result = manager
            .execute_with_retry(|| async {
                *calls.lock() += 1;
                Err::<(), RawError>(UpstreamFailure::boxed("16 UNAUTHENTICATED"))
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Auth);
        assert_eq!(*calls.lock(), 1);
        assert_eq!(manager.stats().non_retryable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_takes_precedence() {
        let manager = RetryManager::new("test", fast_policy(1));
        let stamps: Mutex<Vec<Instant>> = Mutex::new(Vec::new());

        let _ = manager
            .execute_with_retry(|| async {
                stamps.lock().push(Instant::now());
                Err::<(), RawError>(Box::new(ClassifiedError::rate_limited(
                    "bucket empty",
                    Some(Duration::from_millis(1500)),
                )))
            })
            .await;

        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 2);
        assert_eq!(stamps[1] - stamps[0], Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_oversized_hint_surfaces_immediately() {
        let manager = RetryManager::new("test", fast_policy(3));
        let calls = Mutex::new(0);

        let result = manager
            .execute_with_retry(|| async {
                *calls.lock() += 1;
                Err::<(), RawError>(UpstreamFailure::boxed(
                    "RESOURCE_EXHAUSTED daily quota, retry after 3600 seconds",
                ))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quota);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3600)));
        assert_eq!(*calls.lock(), 1);
    }
}
