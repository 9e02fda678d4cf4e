//! Adaptive caching and request coordination for a quota-limited analytics API
//!
//! Every caller-facing query flows through [`AnalyticsService`]:
//!
//! ```text
//!   resolve(data_type, target, options)
//!        │
//!   interceptors ──► validation ──► RequestCoordinator
//!                                    │  cache read (CacheStore)
//!                                    │  in-flight dedup
//!                                    ▼
//!                               RetryManager (per data-type profile)
//!                                    │
//!                          RateLimiter ──► QuotaTracker ──► upstream
//! ```
//!
//! Alongside the request path, [`UsageTracker`] records which query shapes are
//! popular, [`CacheWarmer`] refreshes them before they expire, and
//! [`PerformanceAnalytics`] scores the layer and recommends (or applies)
//! optimization flag changes.
//!
//! # Example
//!
//! ```rust,no_run
//! use pulse_cache::{MemoryStore, MemoryStoreConfig, QueryOptions};
//! use pulse_coordinator::{AnalyticsQuery, AnalyticsService, AnalyticsUpstream, RawError};
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! struct Fixed;
//!
//! #[async_trait::async_trait]
//! impl AnalyticsUpstream for Fixed {
//!     async fn run_query(&self, _query: &AnalyticsQuery) -> Result<Value, RawError> {
//!         Ok(json!({"rows": []}))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new(MemoryStoreConfig::default())?);
//! let service = AnalyticsService::builder(Arc::new(Fixed), store).build()?;
//! service.start();
//!
//! let response = service
//!     .resolve("sessions", "property-42", QueryOptions::new().with_limit(10))
//!     .await;
//! assert!(response.success);
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod interceptor;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod service;
pub mod upstream;
pub mod usage;
pub mod warmer;

pub use analytics::{
    AnalyticsConfig, AutoApply, FlagAutoApply, PerformanceAnalytics, PerformanceReport,
    Recommendation, RecommendationKind, SampleOutcome, Severity, ShapeReport,
};
pub use classify::{classify, classify_message};
pub use config::{
    CacheTtlConfig, CoordinatorConfig, OperationClass, OptimizationFlags, OptimizationUpdate,
    RetryProfiles, RoutingConfig,
};
pub use coordinator::{CachePolicy, CoordinatorStats, DedupConfig, RequestCoordinator, Resolved, Source};
pub use error::{ClassifiedError, ConfigError, CoordinatorError, ErrorKind, RawError, Result};
pub use interceptor::{Interceptor, InterceptorChain, RequestContext, TracingInterceptor};
pub use metrics::PulseMetrics;
pub use quota::{
    AlertLevel, QuotaAlert, QuotaCheck, QuotaConfig, QuotaDenied, QuotaSnapshot, QuotaSpec,
    QuotaTracker, QuotaWindowKind,
};
pub use rate_limit::{Admission, BucketConfig, BucketSnapshot, RateLimitConfig, RateLimiter};
pub use retry::{RetryManager, RetryPolicy, RetryStats};
pub use service::{
    AnalyticsService, BatchResponse, ErrorBody, RateLimitTotals, ServiceBuilder, ServiceResponse,
    ServiceStats,
};
pub use upstream::{AnalyticsQuery, AnalyticsUpstream, UpstreamFailure};
pub use usage::{QueryVariant, UsagePattern, UsageTracker};
pub use warmer::{CacheWarmer, Priority, WarmCycleReport, WarmExecutor, WarmerConfig, WarmerStats, WarmingTask};
