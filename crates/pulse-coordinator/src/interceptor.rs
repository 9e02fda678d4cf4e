//! Request/response interceptors
//!
//! Interceptors run in registration order on the way in and in reverse order
//! on the way out. An interceptor may reject a request by returning an error
//! from [`Interceptor::on_request`]; later interceptors are then skipped, but
//! every interceptor that already saw the request still sees the response.

use pulse_cache::QueryOptions;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::ClassifiedError;
use crate::service::ServiceResponse;

/// Mutable per-request state shared along the chain
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: u64,
    pub data_type: String,
    pub target_id: String,
    pub options: QueryOptions,
    pub user: Option<String>,
    pub started_at: Instant,
    /// Free-form annotations interceptors leave for each other
    pub attributes: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(
        request_id: u64,
        data_type: impl Into<String>,
        target_id: impl Into<String>,
        options: QueryOptions,
        user: Option<String>,
    ) -> Self {
        Self {
            request_id,
            data_type: data_type.into(),
            target_id: target_id.into(),
            options,
            user,
            started_at: Instant::now(),
            attributes: BTreeMap::new(),
        }
    }
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn on_request(&self, _ctx: &mut RequestContext) -> Result<(), ClassifiedError> {
        Ok(())
    }

    fn on_response(&self, _ctx: &RequestContext, _response: &mut ServiceResponse) {}
}

/// Ordered interceptor list
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name()))
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run request hooks. On rejection returns how many interceptors ran
    /// (including the rejecting one) along with the error.
    pub fn before(&self, ctx: &mut RequestContext) -> Result<usize, (usize, ClassifiedError)> {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            if let Err(e) = interceptor.on_request(ctx) {
                tracing::debug!(interceptor = interceptor.name(), "Request rejected: {}", e);
                return Err((index + 1, e));
            }
        }
        Ok(self.interceptors.len())
    }

    /// Run response hooks of the first `ran` interceptors, last to first.
    pub fn after(&self, ran: usize, ctx: &RequestContext, response: &mut ServiceResponse) {
        for interceptor in self.interceptors.iter().take(ran).rev() {
            interceptor.on_response(ctx, response);
        }
    }
}

/// Logs every request and its outcome
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInterceptor;

impl Interceptor for TracingInterceptor {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ClassifiedError> {
        tracing::debug!(
            request_id = ctx.request_id,
            data_type = %ctx.data_type,
            target = %ctx.target_id,
            user = ctx.user.as_deref(),
            "Resolving analytics query"
        );
        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut ServiceResponse) {
        let elapsed_ms = ctx.started_at.elapsed().as_millis() as u64;
        if response.success {
            tracing::info!(
                request_id = ctx.request_id,
                data_type = %ctx.data_type,
                source = ?response.source,
                cached = response.cached,
                elapsed_ms,
                "Query resolved"
            );
        } else {
            tracing::warn!(
                request_id = ctx.request_id,
                data_type = %ctx.data_type,
                code = response.error.as_ref().map(|e| e.code.as_str()),
                elapsed_ms,
                "Query failed"
            );
        }
    }
}
