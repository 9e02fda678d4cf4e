//! Upstream analytics provider contract

use crate::error::RawError;
use async_trait::async_trait;
use pulse_cache::{QueryOptions, RequestKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One query as handed to the upstream provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub data_type: String,
    pub target_id: String,
    pub options: QueryOptions,
    pub request_key: RequestKey,
}

impl AnalyticsQuery {
    pub fn new(data_type: impl Into<String>, target_id: impl Into<String>, options: QueryOptions) -> Self {
        let data_type = data_type.into();
        let target_id = target_id.into();
        let request_key = RequestKey::new(&data_type, &target_id, &options);
        Self {
            data_type,
            target_id,
            options,
            request_key,
        }
    }
}

/// Executes one query against the provider.
///
/// Implementations return raw, unclassified errors; the coordinator only relies
/// on their message.
#[async_trait]
pub trait AnalyticsUpstream: Send + Sync {
    async fn run_query(&self, query: &AnalyticsQuery) -> Result<Value, RawError>;

    fn name(&self) -> &str {
        "upstream"
    }
}

/// Plain message error for adapters that have nothing richer to report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UpstreamFailure {
    message: String,
}

impl UpstreamFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn boxed(message: impl Into<String>) -> RawError {
        Box::new(Self::new(message))
    }
}
