//! Coordinator configuration
//!
//! Every section has working defaults; [`CoordinatorConfig::from_env`] and
//! [`CoordinatorConfig::from_json_file`] only override what they name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::analytics::AnalyticsConfig;
use crate::coordinator::DedupConfig;
use crate::error::ConfigError;
use crate::quota::QuotaConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::warmer::WarmerConfig;

/// Serialize a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Cache lifetimes per data type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Seconds, keyed by lowercase data type
    pub per_data_type: BTreeMap<String, u64>,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        let per_data_type = [
            ("realtime", 60),
            ("sessions", 30 * 60),
            ("users", 60 * 60),
            ("pageviews", 30 * 60),
            ("events", 30 * 60),
            ("conversions", 60 * 60),
            ("traffic_sources", 2 * 60 * 60),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            default_ttl: Duration::from_secs(30 * 60),
            per_data_type,
        }
    }
}

impl CacheTtlConfig {
    pub fn ttl_for(&self, data_type: &str) -> Duration {
        self.per_data_type
            .get(&data_type.to_lowercase())
            .map_or(self.default_ttl, |secs| Duration::from_secs(*secs))
    }

    pub fn with_ttl(mut self, data_type: &str, ttl: Duration) -> Self {
        self.per_data_type.insert(data_type.to_lowercase(), ttl.as_secs());
        self
    }
}

/// Retry profiles by operation class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryProfiles {
    pub realtime: RetryPolicy,
    pub standard: RetryPolicy,
    pub quota_sensitive: RetryPolicy,
}

impl Default for RetryProfiles {
    fn default() -> Self {
        Self {
            realtime: RetryPolicy::realtime(),
            standard: RetryPolicy::standard(),
            quota_sensitive: RetryPolicy::quota_sensitive(),
        }
    }
}

/// Which bucket and retry profile a data type uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Data types served by the realtime bucket and retry profile
    pub realtime_data_types: Vec<String>,
    /// Data types retried with the quota-sensitive profile
    pub quota_sensitive_data_types: Vec<String>,
    pub realtime_category: String,
    pub reporting_category: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            realtime_data_types: vec!["realtime".to_string()],
            quota_sensitive_data_types: vec!["conversions".to_string(), "traffic_sources".to_string()],
            realtime_category: "realtime".to_string(),
            reporting_category: "reporting".to_string(),
        }
    }
}

/// Operation class derived from a data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Realtime,
    Standard,
    QuotaSensitive,
}

impl RoutingConfig {
    pub fn class_of(&self, data_type: &str) -> OperationClass {
        let matches = |list: &[String]| list.iter().any(|t| t.eq_ignore_ascii_case(data_type));
        if matches(&self.realtime_data_types) {
            OperationClass::Realtime
        } else if matches(&self.quota_sensitive_data_types) {
            OperationClass::QuotaSensitive
        } else {
            OperationClass::Standard
        }
    }

    pub fn category_of(&self, data_type: &str) -> &str {
        match self.class_of(data_type) {
            OperationClass::Realtime => &self.realtime_category,
            OperationClass::Standard | OperationClass::QuotaSensitive => &self.reporting_category,
        }
    }
}

/// Runtime switches, toggled through the admin surface or auto-apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationFlags {
    pub caching: bool,
    pub deduplication: bool,
    pub warming: bool,
    /// Fan batch requests out in parallel rather than one at a time
    pub batching: bool,
    pub rate_limiting: bool,
}

impl Default for OptimizationFlags {
    fn default() -> Self {
        Self {
            caching: true,
            deduplication: true,
            warming: true,
            batching: true,
            rate_limiting: true,
        }
    }
}

/// Partial update of [`OptimizationFlags`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationUpdate {
    pub caching: Option<bool>,
    pub deduplication: Option<bool>,
    pub warming: Option<bool>,
    pub batching: Option<bool>,
    pub rate_limiting: Option<bool>,
}

impl OptimizationFlags {
    pub fn apply(&mut self, update: OptimizationUpdate) {
        if let Some(v) = update.caching {
            self.caching = v;
        }
        if let Some(v) = update.deduplication {
            self.deduplication = v;
        }
        if let Some(v) = update.warming {
            self.warming = v;
        }
        if let Some(v) = update.batching {
            self.batching = v;
        }
        if let Some(v) = update.rate_limiting {
            self.rate_limiting = v;
        }
    }
}

/// Full configuration of the coordination layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub dedup: DedupConfig,
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub retry: RetryProfiles,
    pub cache_ttl: CacheTtlConfig,
    pub routing: RoutingConfig,
    pub warmer: WarmerConfig,
    pub analytics: AnalyticsConfig,
    pub optimizations: OptimizationFlags,
    /// Interval of the quota rollover and usage decay sweep
    #[serde(with = "duration_ms")]
    pub maintenance_interval: Duration,
    /// Usage patterns not seen for this long are dropped
    #[serde(with = "duration_ms")]
    pub usage_retention: Duration,
    /// Batch requests larger than this are rejected
    pub max_batch_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dedup: DedupConfig::default(),
            rate_limit: RateLimitConfig::default(),
            quota: QuotaConfig::default(),
            retry: RetryProfiles::default(),
            cache_ttl: CacheTtlConfig::default(),
            routing: RoutingConfig::default(),
            warmer: WarmerConfig::default(),
            analytics: AnalyticsConfig::default(),
            optimizations: OptimizationFlags::default(),
            maintenance_interval: Duration::from_secs(60),
            usage_retention: Duration::from_secs(24 * 3600),
            max_batch_size: 20,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_retry(mut self, retry: RetryProfiles) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_warmer(mut self, warmer: WarmerConfig) -> Self {
        self.warmer = warmer;
        self
    }

    pub fn with_optimizations(mut self, optimizations: OptimizationFlags) -> Self {
        self.optimizations = optimizations;
        self
    }

    /// Load from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PULSE_*` environment overrides on top of `self`.
    pub fn from_env(mut self) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Invalid(format!("{name}={raw} is not valid"))),
                Err(_) => Ok(None),
            }
        }

        if let Some(ms) = parse::<u64>("PULSE_DEDUP_WAIT_TIMEOUT_MS")? {
            self.dedup.wait_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>("PULSE_DEDUP_MAX_WAITERS")? {
            self.dedup.max_waiters = n;
        }
        if let Some(ms) = parse::<u64>("PULSE_STORE_TIMEOUT_MS")? {
            self.dedup.store_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>("PULSE_DEFAULT_TTL_SECS")? {
            self.cache_ttl.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>("PULSE_WARM_INTERVAL_SECS")? {
            self.warmer.interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<usize>("PULSE_WARM_MAX_CONCURRENT")? {
            self.warmer.max_concurrent = n;
        }
        if let Some(enabled) = parse::<bool>("PULSE_WARMING")? {
            self.optimizations.warming = enabled;
        }
        if let Some(limit) = parse::<u64>("PULSE_QUOTA_HOURLY_LIMIT")? {
            set_limit(&mut self.quota, "hourly", limit);
        }
        if let Some(limit) = parse::<u64>("PULSE_QUOTA_DAILY_LIMIT")? {
            set_limit(&mut self.quota, "daily", limit);
        }

        self.retry.realtime = RetryPolicy::from_env("PULSE_RETRY_REALTIME", self.retry.realtime);
        self.retry.standard = RetryPolicy::from_env("PULSE_RETRY_STANDARD", self.retry.standard);
        self.retry.quota_sensitive =
            RetryPolicy::from_env("PULSE_RETRY_QUOTA_SENSITIVE", self.retry.quota_sensitive);

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dedup.validate()?;
        self.rate_limit.validate()?;
        self.quota.validate()?;
        self.retry.realtime.validate()?;
        self.retry.standard.validate()?;
        self.retry.quota_sensitive.validate()?;
        self.warmer.validate()?;
        self.analytics.validate()?;
        if self.cache_ttl.default_ttl.is_zero() {
            return Err(ConfigError::Invalid("default_ttl must be positive".to_string()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "maintenance_interval must be positive".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

fn set_limit(quota: &mut QuotaConfig, name: &str, limit: u64) {
    if let Some(spec) = quota.quotas.iter_mut().find(|q| q.name == name) {
        spec.limit = limit;
    }
}
