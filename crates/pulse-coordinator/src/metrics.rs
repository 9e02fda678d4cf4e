//! Prometheus metrics for the coordination layer

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Counters and histograms exported on `/metrics`
#[derive(Debug, Clone)]
pub struct PulseMetrics {
    registry: Registry,

    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub upstream_calls: IntCounter,
    pub dedup_joins: IntCounter,
    pub rate_limit_denials: IntCounter,
    pub quota_denials: IntCounter,
    pub retries: IntCounter,
    /// Final upstream failures, labelled by error kind
    pub upstream_errors: IntCounterVec,
    pub warmed_entries: IntCounter,
    pub pending_requests: IntGauge,
    pub request_latency: Histogram,
}

impl PulseMetrics {
    #[allow(clippy::too_many_lines)]
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits = IntCounter::new("pulse_cache_hits_total", "Requests served from cache")?;
        registry.register(Box::new(cache_hits.clone()))?;

        let cache_misses = IntCounter::new("pulse_cache_misses_total", "Requests that missed the cache")?;
        registry.register(Box::new(cache_misses.clone()))?;

        let upstream_calls = IntCounter::new(
            "pulse_upstream_calls_total",
            "Upstream fetches started by a dedup leader",
        )?;
        registry.register(Box::new(upstream_calls.clone()))?;

        let dedup_joins = IntCounter::new(
            "pulse_dedup_joins_total",
            "Callers that joined an in-flight request instead of fetching",
        )?;
        registry.register(Box::new(dedup_joins.clone()))?;

        let rate_limit_denials = IntCounter::new(
            "pulse_rate_limit_denials_total",
            "Upstream attempts refused by the token bucket",
        )?;
        registry.register(Box::new(rate_limit_denials.clone()))?;

        let quota_denials = IntCounter::new(
            "pulse_quota_denials_total",
            "Upstream attempts refused by a quota window",
        )?;
        registry.register(Box::new(quota_denials.clone()))?;

        let retries = IntCounter::new("pulse_retries_total", "Upstream retry attempts")?;
        registry.register(Box::new(retries.clone()))?;

        let upstream_errors = IntCounterVec::new(
            Opts::new("pulse_upstream_errors_total", "Final upstream failures by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(upstream_errors.clone()))?;

        let warmed_entries = IntCounter::new("pulse_warmed_entries_total", "Cache entries written by the warmer")?;
        registry.register(Box::new(warmed_entries.clone()))?;

        let pending_requests = IntGauge::new("pulse_pending_requests", "In-flight deduplicated requests")?;
        registry.register(Box::new(pending_requests.clone()))?;

        let request_latency = Histogram::with_opts(
            HistogramOpts::new(
                "pulse_request_latency_seconds",
                "End-to-end resolve latency",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            upstream_calls,
            dedup_joins,
            rate_limit_denials,
            quota_denials,
            retries,
            upstream_errors,
            warmed_entries,
            pending_requests,
            request_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// All metrics in the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_text() {
        let metrics = PulseMetrics::new().unwrap();
        metrics.cache_hits.inc();
        metrics.cache_hits.inc();
        metrics.upstream_errors.with_label_values(&["network"]).inc();
        metrics.request_latency.observe(0.2);

        let text = metrics.gather_text();
        assert!(text.contains("pulse_cache_hits_total 2"));
        assert!(text.contains("pulse_upstream_errors_total{kind=\"network\"} 1"));
        assert!(text.contains("pulse_request_latency_seconds_count 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = PulseMetrics::new().unwrap();
        let b = PulseMetrics::new().unwrap();
        a.retries.inc();
        assert_eq!(b.retries.get(), 0);
    }
}
