//! Gateway configuration.
//!
//! Values come from CLI arguments, `PULSE_GATEWAY_*` environment variables, or
//! defaults. Coordination-layer tuning (TTLs, buckets, quotas, retry profiles)
//! lives in an optional JSON file, further overridden by `PULSE_*` variables.
//!
//! # Example
//!
//! ```no_run
//! use pulse_gateway::ServerConfig;
//!
//! let config = ServerConfig::from_args();
//! config.validate().expect("Invalid configuration");
//!
//! println!("Listening on {}", config.bind);
//! println!("Upstream: {}", config.upstream_url);
//! ```

use clap::Parser;
use pulse_coordinator::CoordinatorConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::ServerError;

/// Server configuration loaded from CLI args and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pulse-gateway",
    about = "Caching and request coordination gateway for a quota-limited analytics API",
    version
)]
pub struct ServerConfig {
    /// HTTP bind address
    #[arg(long, env = "PULSE_GATEWAY_BIND", default_value = "0.0.0.0:8088")]
    pub bind: SocketAddr,

    /// Base URL of the analytics provider
    #[arg(
        long,
        env = "PULSE_GATEWAY_UPSTREAM_URL",
        default_value = "http://127.0.0.1:9000"
    )]
    pub upstream_url: String,

    /// Timeout for one upstream request, in seconds
    #[arg(long, env = "PULSE_GATEWAY_UPSTREAM_TIMEOUT", default_value_t = 30)]
    pub upstream_timeout_secs: u64,

    /// Coordinator configuration file (JSON)
    #[arg(long, env = "PULSE_GATEWAY_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Maximum entries held by the in-process cache store
    #[arg(long, env = "PULSE_GATEWAY_CACHE_ENTRIES", default_value_t = 10_000)]
    pub cache_entries: usize,

    /// Do not start the warming, maintenance and rollup loops
    #[arg(long, env = "PULSE_GATEWAY_NO_BACKGROUND")]
    pub no_background: bool,
}

impl ServerConfig {
    /// Parse configuration from command-line arguments.
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if the upstream URL is not an absolute
    /// http(s) URL, the timeout is zero, the cache is sized to zero, or the
    /// config file does not exist.
    pub fn validate(&self) -> Result<(), ServerError> {
        let url = Url::parse(&self.upstream_url)
            .map_err(|e| ServerError::Config(format!("invalid upstream URL '{}': {e}", self.upstream_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServerError::Config(format!(
                "upstream URL must use http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.upstream_timeout_secs == 0 {
            return Err(ServerError::Config("upstream timeout must be positive".to_string()));
        }
        if self.cache_entries == 0 {
            return Err(ServerError::Config("cache must hold at least one entry".to_string()));
        }
        if let Some(path) = &self.config_file
            && !path.exists()
        {
            return Err(ServerError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Ok(())
    }

    /// Coordinator configuration: file (if any), then `PULSE_*` overrides.
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig, ServerError> {
        let base = match &self.config_file {
            Some(path) => CoordinatorConfig::from_json_file(path)?,
            None => CoordinatorConfig::default(),
        };
        let config = base.from_env()?;
        config.validate()?;
        Ok(config)
    }
}
