//! HTTP gateway for the pulse coordination layer.
//!
//! Exposes [`pulse_coordinator::AnalyticsService`] over HTTP and connects it to
//! an analytics provider reachable over HTTP.
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/health` | Liveness and uptime |
//! | GET | `/metrics` | Prometheus metrics |
//! | POST | `/v1/query` | Resolve one query (`x-user-id` selects a per-user bucket) |
//! | POST | `/v1/batch` | Resolve several data types for one target |
//! | GET | `/v1/stats` | Coordinator, limiter, quota, warmer and analytics stats |
//! | POST | `/v1/admin/cache/clear` | Delete cached entries matching `?pattern=` |
//! | POST | `/v1/admin/cache/invalidate/{target}` | Delete cached entries for a target |
//! | POST | `/v1/admin/warm` | Run a warming cycle now |
//! | GET/POST | `/v1/admin/optimizations` | Read or toggle optimization flags |
//!
//! # Example
//!
//! ```no_run
//! use pulse_gateway::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let config = ServerConfig::from_args();
//!     config.validate()?;
//!
//!     Server::new(config)?.run().await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod upstream_http;

pub use config::ServerConfig;
pub use error::{ServerError, UpstreamError};
pub use server::{AppState, Server};
pub use upstream_http::HttpUpstream;
