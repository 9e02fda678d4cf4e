//! Rolling-window quota tracking
//!
//! Each quota type counts usage inside an hourly or daily window aligned to
//! the Unix epoch (top of the hour, UTC midnight). When the clock passes the
//! window's reset instant the counter drops to zero and the reset instant
//! moves to the next boundary that is still in the future, however many
//! windows went by unobserved.
//!
//! Threshold alerts fire once per threshold per window.

use parking_lot::{Mutex, RwLock};
use pulse_cache::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ConfigError;

/// Window length of a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindowKind {
    Hourly,
    Daily,
}

impl QuotaWindowKind {
    pub const fn length(self) -> Duration {
        match self {
            Self::Hourly => Duration::from_secs(3600),
            Self::Daily => Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub name: String,
    pub window: QuotaWindowKind,
    pub limit: u64,
}

impl QuotaSpec {
    pub fn new(name: impl Into<String>, window: QuotaWindowKind, limit: u64) -> Self {
        Self {
            name: name.into(),
            window,
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub quotas: Vec<QuotaSpec>,
    /// Fraction of the limit that raises a warning alert
    pub warning_threshold: f64,
    /// Fraction of the limit that raises a critical alert
    pub critical_threshold: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            quotas: vec![
                QuotaSpec::new("hourly", QuotaWindowKind::Hourly, 1_000),
                QuotaSpec::new("daily", QuotaWindowKind::Daily, 10_000),
            ],
            warning_threshold: 0.7,
            critical_threshold: 0.9,
        }
    }
}

impl QuotaConfig {
    pub fn with_quota(mut self, spec: QuotaSpec) -> Self {
        self.quotas.retain(|q| q.name != spec.name);
        self.quotas.push(spec);
        self
    }

    pub fn with_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for quota in &self.quotas {
            if quota.limit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "quota {} must have a positive limit",
                    quota.name
                )));
            }
        }
        let valid = |t: f64| t > 0.0 && t <= 1.0;
        if !valid(self.warning_threshold)
            || !valid(self.critical_threshold)
            || self.warning_threshold >= self.critical_threshold
        {
            return Err(ConfigError::Invalid(
                "quota thresholds must satisfy 0 < warning < critical <= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Payload handed to alert callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaAlert {
    pub level: AlertLevel,
    pub quota_type: String,
    pub usage_percent: f64,
    pub remaining: u64,
}

pub type AlertCallback = Arc<dyn Fn(&QuotaAlert) + Send + Sync>;

/// Result of a check or track call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// First quota that refused an [`QuotaTracker::acquire_all`] request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDenied {
    pub quota_type: String,
    pub used: u64,
    pub limit: u64,
    pub resets_in: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub quota_type: String,
    pub window: QuotaWindowKind,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub usage_percent: f64,
    pub resets_in_seconds: u64,
}

#[derive(Debug)]
struct QuotaWindow {
    spec: QuotaSpec,
    used: u64,
    window_reset_at: SystemTime,
    /// One flag per configured threshold, cleared on rollover
    fired: Vec<bool>,
}

/// First window boundary strictly after `now`.
fn next_boundary(now: SystemTime, length: Duration) -> SystemTime {
    let len = length.as_secs().max(1);
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    UNIX_EPOCH + Duration::from_secs((since_epoch / len + 1) * len)
}

impl QuotaWindow {
    fn new(spec: QuotaSpec, thresholds: usize, now: SystemTime) -> Self {
        let window_reset_at = next_boundary(now, spec.window.length());
        Self {
            spec,
            used: 0,
            window_reset_at,
            fired: vec![false; thresholds],
        }
    }

    /// Reset when the window has passed. Returns true on rollover.
    fn roll(&mut self, now: SystemTime) -> bool {
        if now < self.window_reset_at {
            return false;
        }
        self.used = 0;
        self.fired.iter_mut().for_each(|f| *f = false);
        self.window_reset_at = next_boundary(now, self.spec.window.length());
        true
    }

    fn remaining(&self) -> u64 {
        self.spec.limit.saturating_sub(self.used)
    }

    fn check(&self, cost: u64) -> QuotaCheck {
        QuotaCheck {
            allowed: self.used.saturating_add(cost) <= self.spec.limit,
            used: self.used,
            limit: self.spec.limit,
            remaining: self.remaining(),
        }
    }

    fn usage_percent(&self) -> f64 {
        self.used as f64 / self.spec.limit.max(1) as f64 * 100.0
    }

    fn add(&mut self, cost: u64, thresholds: &[(f64, AlertLevel)]) -> Vec<QuotaAlert> {
        self.used = self.used.saturating_add(cost).min(self.spec.limit);

        let ratio = self.used as f64 / self.spec.limit.max(1) as f64;
        let mut alerts = Vec::new();
        for (fired, (threshold, level)) in self.fired.iter_mut().zip(thresholds) {
            if !*fired && ratio >= *threshold {
                *fired = true;
                alerts.push(QuotaAlert {
                    level: *level,
                    quota_type: self.spec.name.clone(),
                    usage_percent: ratio * 100.0,
                    remaining: self.spec.limit.saturating_sub(self.used),
                });
            }
        }
        alerts
    }

    fn resets_in(&self, now: SystemTime) -> Duration {
        self.window_reset_at.duration_since(now).unwrap_or_default()
    }
}

/// Usage counters for every configured quota type
pub struct QuotaTracker {
    windows: Mutex<BTreeMap<String, QuotaWindow>>,
    thresholds: Vec<(f64, AlertLevel)>,
    callbacks: RwLock<Vec<AlertCallback>>,
    clock: SharedClock,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("windows", &self.windows)
            .field("thresholds", &self.thresholds)
            .field("callbacks", &self.callbacks.read().len())
            .finish_non_exhaustive()
    }
}

impl QuotaTracker {
    pub fn new(config: &QuotaConfig, clock: SharedClock) -> Self {
        let thresholds = vec![
            (config.warning_threshold, AlertLevel::Warning),
            (config.critical_threshold, AlertLevel::Critical),
        ];
        let now = clock.now();
        let windows = config
            .quotas
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    QuotaWindow::new(spec.clone(), thresholds.len(), now),
                )
            })
            .collect();
        Self {
            windows: Mutex::new(windows),
            thresholds,
            callbacks: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Register a callback for threshold crossings.
    pub fn on_alert(&self, callback: impl Fn(&QuotaAlert) + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Would `cost` more units fit in the current window?
    pub fn check(&self, quota_type: &str, cost: u64) -> Result<QuotaCheck, ConfigError> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let window = windows
            .get_mut(quota_type)
            .ok_or_else(|| ConfigError::UnknownQuota(quota_type.to_string()))?;
        window.roll(now);
        Ok(window.check(cost))
    }

    /// Count `cost` units of usage. Saturates at the limit.
    pub fn track(&self, quota_type: &str, cost: u64) -> Result<QuotaCheck, ConfigError> {
        let now = self.clock.now();
        let (check, alerts) = {
            let mut windows = self.windows.lock();
            let window = windows
                .get_mut(quota_type)
                .ok_or_else(|| ConfigError::UnknownQuota(quota_type.to_string()))?;
            window.roll(now);
            let alerts = window.add(cost, &self.thresholds);
            (window.check(0), alerts)
        };
        self.dispatch(&alerts);
        Ok(check)
    }

    /// Check every quota and, only if all of them admit `cost`, track it against each.
    pub fn acquire_all(&self, cost: u64) -> Result<(), QuotaDenied> {
        let now = self.clock.now();
        let alerts = {
            let mut windows = self.windows.lock();
            for window in windows.values_mut() {
                window.roll(now);
            }
            if let Some(window) = windows.values().find(|w| !w.check(cost).allowed) {
                return Err(QuotaDenied {
                    quota_type: window.spec.name.clone(),
                    used: window.used,
                    limit: window.spec.limit,
                    resets_in: window.resets_in(now),
                });
            }
            windows
                .values_mut()
                .flat_map(|w| w.add(cost, &self.thresholds))
                .collect::<Vec<_>>()
        };
        self.dispatch(&alerts);
        Ok(())
    }

    fn dispatch(&self, alerts: &[QuotaAlert]) {
        if alerts.is_empty() {
            return;
        }
        let callbacks = self.callbacks.read().clone();
        for alert in alerts {
            tracing::warn!(
                quota = %alert.quota_type,
                level = ?alert.level,
                usage_percent = alert.usage_percent,
                remaining = alert.remaining,
                "Quota threshold crossed"
            );
            for callback in &callbacks {
                callback(alert);
            }
        }
    }

    /// Apply any pending window rollovers. Returns how many windows reset.
    pub fn roll_windows(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let rolled = windows.values_mut().map(|w| w.roll(now)).filter(|rolled| *rolled).count();
        if rolled > 0 {
            tracing::info!(rolled, "Quota windows reset");
        }
        rolled
    }

    pub fn snapshot(&self) -> Vec<QuotaSnapshot> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        windows
            .values_mut()
            .map(|window| {
                window.roll(now);
                QuotaSnapshot {
                    quota_type: window.spec.name.clone(),
                    window: window.spec.window,
                    used: window.used,
                    limit: window.spec.limit,
                    remaining: window.remaining(),
                    usage_percent: window.usage_percent(),
                    resets_in_seconds: window.resets_in(now).as_secs(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pulse_cache::{Clock, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    fn tracker(limit: u64) -> (QuotaTracker, ManualClock) {
        let clock = ManualClock::new();
        let config = QuotaConfig {
            quotas: vec![QuotaSpec::new("hourly", QuotaWindowKind::Hourly, limit)],
            ..QuotaConfig::default()
        };
        (QuotaTracker::new(&config, Arc::new(clock.clone())), clock)
    }

    fn resets_in(tracker: &QuotaTracker) -> Duration {
        Duration::from_secs(tracker.snapshot()[0].resets_in_seconds)
    }

    #[test]
    fn test_exhausted_window_denies() {
        let (tracker, _clock) = tracker(100);
        for _ in 0..100 {
            tracker.track("hourly", 1).unwrap();
        }
        let check = tracker.check("hourly", 1).unwrap();
        assert!(!check.allowed);
        assert_eq!(check.used, 100);
        assert_eq!(check.remaining, 0);
    }

    #[test]
    fn test_track_saturates_at_limit() {
        let (tracker, _clock) = tracker(10);
        let check = tracker.track("hourly", 25).unwrap();
        assert_eq!(check.used, 10);
    }

    #[test]
    fn test_reset_exactly_at_boundary() {
        let (tracker, clock) = tracker(100);
        tracker.track("hourly", 40).unwrap();

        let wait = resets_in(&tracker);
        clock.advance(wait - Duration::from_secs(1));
        assert_eq!(tracker.check("hourly", 1).unwrap().used, 40);

        clock.advance(Duration::from_secs(1));
        assert_eq!(tracker.check("hourly", 1).unwrap().used, 0);
        assert_eq!(resets_in(&tracker), HOUR);
    }

    #[test]
    fn test_long_idle_fast_forwards_to_future_boundary() {
        let (tracker, clock) = tracker(100);
        tracker.track("hourly", 60).unwrap();

        clock.advance(HOUR * 5 + Duration::from_secs(17));
        assert_eq!(tracker.roll_windows(), 1);
        assert_eq!(tracker.roll_windows(), 0);

        let snapshot = &tracker.snapshot()[0];
        assert_eq!(snapshot.used, 0);
        assert!(snapshot.resets_in_seconds > 0 && snapshot.resets_in_seconds <= 3600);

        // The reset instant is on an hour boundary
        let reset_at = clock.now() + Duration::from_secs(snapshot.resets_in_seconds);
        let secs = reset_at.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs % 3600, 0);
    }

    #[test]
    fn test_alert_fires_once_per_threshold_per_window() {
        let (tracker, clock) = tracker(100);
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&alerts);
        tracker.on_alert(move |alert| sink.lock().push(alert.clone()));

        for _ in 0..95 {
            tracker.track("hourly", 1).unwrap();
        }
        {
            let fired = alerts.lock();
            assert_eq!(fired.len(), 2);
            assert_eq!(fired[0].level, AlertLevel::Warning);
            assert_eq!(fired[0].remaining, 30);
            assert!((fired[0].usage_percent - 70.0).abs() < 1e-9);
            assert_eq!(fired[1].level, AlertLevel::Critical);
            assert_eq!(fired[1].quota_type, "hourly");
        }

        clock.advance(resets_in(&tracker));
        for _ in 0..75 {
            tracker.track("hourly", 1).unwrap();
        }
        assert_eq!(alerts.lock().len(), 3);
    }

    #[test]
    fn test_single_jump_fires_both_levels() {
        let (tracker, _clock) = tracker(10);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        tracker.on_alert(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.track("hourly", 10).unwrap();
        tracker.track("hourly", 1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_acquire_all_is_atomic() {
        let clock = ManualClock::new();
        let config = QuotaConfig {
            quotas: vec![
                QuotaSpec::new("hourly", QuotaWindowKind::Hourly, 100),
                QuotaSpec::new("daily", QuotaWindowKind::Daily, 2),
            ],
            ..QuotaConfig::default()
        };
        let tracker = QuotaTracker::new(&config, Arc::new(clock));

        tracker.acquire_all(1).unwrap();
        tracker.acquire_all(1).unwrap();
        let denied = tracker.acquire_all(1).unwrap_err();
        assert_eq!(denied.quota_type, "daily");
        assert!(denied.resets_in <= Duration::from_secs(86_400));

        // The refused call did not count against the hourly window
        assert_eq!(tracker.check("hourly", 0).unwrap().used, 2);
    }

    #[test]
    fn test_unknown_quota() {
        let (tracker, _clock) = tracker(10);
        assert!(matches!(
            tracker.check("monthly", 1),
            Err(ConfigError::UnknownQuota(name)) if name == "monthly"
        ));
        assert!(tracker.track("monthly", 1).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(QuotaConfig::default().validate().is_ok());
        assert!(QuotaConfig::default().with_thresholds(0.9, 0.7).validate().is_err());
        assert!(
            QuotaConfig::default()
                .with_quota(QuotaSpec::new("hourly", QuotaWindowKind::Hourly, 0))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_daily_boundary_is_utc_midnight() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let boundary = next_boundary(now, QuotaWindowKind::Daily.length());
        let secs = boundary.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs % 86_400, 0);
        assert!(secs > 1_700_000_000 && secs - 1_700_000_000 <= 86_400);
    }
}
