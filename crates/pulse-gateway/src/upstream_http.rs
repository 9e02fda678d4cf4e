//! HTTP adapter for the analytics provider.
//!
//! Each query is posted as JSON to `{base_url}/v1/query`. Failures are
//! returned as [`UpstreamError`]s whose messages the coordinator classifies.

use async_trait::async_trait;
use pulse_coordinator::{AnalyticsQuery, AnalyticsUpstream, RawError};
use reqwest::{Client, ClientBuilder};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{ServerError, UpstreamError};

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Analytics provider reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    endpoint: Url,
}

impl HttpUpstream {
    /// Create an adapter for the provider at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the URL is invalid or the client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServerError> {
        let base = Url::parse(base_url)
            .map_err(|e| ServerError::Config(format!("invalid upstream URL '{base_url}': {e}")))?;
        let endpoint = base
            .join("v1/query")
            .map_err(|e| ServerError::Config(format!("invalid upstream URL '{base_url}': {e}")))?;

        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .gzip(true)
            .user_agent(concat!("pulse-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, query: &AnalyticsQuery) -> Result<Value, UpstreamError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(query)
            .send()
            .await
            .map_err(UpstreamError::from_send)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|&i| body.is_char_boundary(i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(UpstreamError::Status {
                status,
                body,
                retry_after,
            });
        }

        response.json::<Value>().await.map_err(UpstreamError::Body)
    }
}

#[async_trait]
impl AnalyticsUpstream for HttpUpstream {
    async fn run_query(&self, query: &AnalyticsQuery) -> Result<Value, RawError> {
        tracing::debug!(endpoint = %self.endpoint, key = %query.request_key, "Querying upstream");
        self.post(query).await.map_err(|e| Box::new(e) as RawError)
    }

    fn name(&self) -> &str {
        "http"
    }
}
