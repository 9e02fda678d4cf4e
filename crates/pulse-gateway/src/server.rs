//! Server state and orchestration.

use pulse_cache::{MemoryStore, MemoryStoreConfig, SystemClock};
use pulse_coordinator::{AnalyticsService, AnalyticsUpstream, CoordinatorConfig, TracingInterceptor};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::upstream_http::HttpUpstream;

/// Shared application state for HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    service: AnalyticsService,
    started_at: SystemTime,
}

impl AppState {
    /// Build the service against the configured HTTP upstream.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if any configuration is invalid.
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let coordinator_config = config.coordinator_config()?;
        let upstream = HttpUpstream::new(&config.upstream_url, config.upstream_timeout())?;
        tracing::info!(endpoint = %upstream.endpoint(), "Upstream configured");

        let store_config = MemoryStoreConfig::default().with_max_entries(config.cache_entries);
        Self::with_upstream(Arc::new(upstream), store_config, coordinator_config)
    }

    /// Build the service against any upstream implementation.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the store or coordinator config is invalid.
    pub fn with_upstream(
        upstream: Arc<dyn AnalyticsUpstream>,
        store_config: MemoryStoreConfig,
        coordinator_config: CoordinatorConfig,
    ) -> Result<Self, ServerError> {
        let clock = SystemClock::shared();
        let store = Arc::new(MemoryStore::new_with_cleanup(store_config, Arc::clone(&clock))?);
        let service = AnalyticsService::builder(upstream, store)
            .config(coordinator_config)
            .clock(clock)
            .interceptor(Arc::new(TracingInterceptor))
            .build()?;

        Ok(Self {
            service,
            started_at: SystemTime::now(),
        })
    }

    #[must_use]
    pub const fn service(&self) -> &AnalyticsService {
        &self.service
    }

    /// Server uptime in seconds.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Server orchestration.
pub struct Server {
    state: Arc<AppState>,
    config: ServerConfig,
}

impl Server {
    /// Create a server from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the application state cannot be built.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let state = AppState::new(&config)?;
        Ok(Self {
            state: Arc::new(state),
            config,
        })
    }

    /// Run until interrupted.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the listener fails to bind or the shutdown
    /// signal cannot be installed.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Starting pulse gateway on {}", self.config.bind);

        let service = self.state.service().clone();
        if self.config.no_background {
            tracing::info!("Background loops disabled");
        } else {
            service.start();
        }

        let bind = self.config.bind;
        let http_state = Arc::clone(&self.state);
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .map_err(|source| ServerError::HttpBindFailed { addr: bind, source })?;
        let http_server = tokio::spawn(async move {
            if let Err(e) = crate::http::serve(listener, http_state).await {
                tracing::error!("HTTP server failed: {e}");
            }
        });

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| ServerError::Shutdown(format!("Failed to listen for shutdown signal: {e}")))?;

        tracing::info!("Shutdown signal received, stopping server");
        service.stop();
        http_server.abort();
        Ok(())
    }
}
