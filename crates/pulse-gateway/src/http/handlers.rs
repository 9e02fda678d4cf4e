//! HTTP request handlers.

use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use pulse_cache::{CacheError, QueryOptions};
use pulse_coordinator::{
    BatchResponse, ClassifiedError, CoordinatorError, ErrorBody, ErrorKind, OptimizationFlags,
    OptimizationUpdate, ServiceResponse, ServiceStats, WarmCycleReport,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Header naming the caller for per-user rate limiting
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub data_type: String,
    pub target_id: String,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub data_types: Vec<String>,
    pub target_id: String,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClearParams {
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedCount {
    pub deleted: usize,
}

fn user_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// HTTP status for a failed resolve.
pub fn status_for(error: &ErrorBody) -> StatusCode {
    match error.kind {
        Some(ErrorKind::Validation) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::Auth) => StatusCode::UNAUTHORIZED,
        Some(ErrorKind::Quota | ErrorKind::RateLimit) => StatusCode::TOO_MANY_REQUESTS,
        Some(ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorKind::Network) => StatusCode::BAD_GATEWAY,
        Some(ErrorKind::Config | ErrorKind::Cache | ErrorKind::Generic) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        None => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn retry_after_header(seconds: Option<u64>) -> Option<(header::HeaderName, HeaderValue)> {
    seconds.map(|s| (header::RETRY_AFTER, HeaderValue::from(s)))
}

/// Handle GET /health.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.uptime_seconds(),
        "background_tasks_running": state.service().is_running(),
    }))
}

/// Handle GET /metrics in the Prometheus text format.
pub async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.service().metrics().gather_text(),
    )
}

/// Handle POST /v1/query.
///
/// Failed resolves keep the full response body; the status code reflects the
/// error kind and quota or rate-limit errors carry `Retry-After`.
pub async fn handle_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Response {
    let service = state.service();
    let response = match user_of(&headers) {
        Some(user) => {
            service
                .resolve_as(&user, &request.data_type, &request.target_id, request.options)
                .await
        }
        None => {
            service
                .resolve(&request.data_type, &request.target_id, request.options)
                .await
        }
    };
    query_reply(response)
}

fn query_reply(response: ServiceResponse) -> Response {
    let failure = response
        .error
        .as_ref()
        .map(|error| (status_for(error), error.retry_after_seconds));
    let Some((status, retry_after)) = failure else {
        return (StatusCode::OK, Json(response)).into_response();
    };
    let mut reply = (status, Json(response)).into_response();
    if let Some((name, value)) = retry_after_header(retry_after) {
        reply.headers_mut().insert(name, value);
    }
    reply
}

/// Handle POST /v1/batch.
///
/// # Errors
///
/// Returns `AppError` if the batch is empty or too large.
pub async fn handle_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    let user = user_of(&headers);
    let batch = state
        .service()
        .resolve_batch(
            &request.data_types,
            &request.target_id,
            request.options,
            user.as_deref(),
        )
        .await?;
    Ok(Json(batch))
}

/// Handle GET /v1/stats.
pub async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<ServiceStats> {
    Json(state.service().stats())
}

/// Handle POST /v1/admin/cache/clear[?pattern=...].
///
/// # Errors
///
/// Returns `AppError` if the pattern is empty or the store fails.
pub async fn handle_clear_cache(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClearParams>,
) -> Result<Json<DeletedCount>, AppError> {
    let deleted = state.service().clear_cache(params.pattern.as_deref()).await?;
    tracing::info!(deleted, pattern = ?params.pattern, "Cache cleared");
    Ok(Json(DeletedCount { deleted }))
}

/// Handle POST /v1/admin/cache/invalidate/{target}.
///
/// # Errors
///
/// Returns `AppError` if the store fails.
pub async fn handle_invalidate_target(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
) -> Result<Json<DeletedCount>, AppError> {
    let deleted = state.service().invalidate_target(&target).await?;
    tracing::info!(deleted, target = %target, "Target invalidated");
    Ok(Json(DeletedCount { deleted }))
}

/// Handle POST /v1/admin/warm.
pub async fn handle_warm(State(state): State<Arc<AppState>>) -> Json<WarmCycleReport> {
    Json(state.service().warm_now().await)
}

/// Handle GET /v1/admin/optimizations.
pub async fn handle_get_optimizations(State(state): State<Arc<AppState>>) -> Json<OptimizationFlags> {
    Json(state.service().optimizations())
}

/// Handle POST /v1/admin/optimizations.
pub async fn handle_set_optimizations(
    State(state): State<Arc<AppState>>,
    Json(update): Json<OptimizationUpdate>,
) -> Json<OptimizationFlags> {
    Json(state.service().set_optimizations(update))
}

/// Application-level error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Request rejected before reaching the coordinator
    Rejected(ClassifiedError),
    /// Cache store failure on an admin operation
    Cache(CacheError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Rejected(err) => {
                let body = ErrorBody::from(&CoordinatorError::from(err));
                (status_for(&body), body.code, body.message)
            }
            Self::Cache(CacheError::InvalidPattern(msg)) => {
                (StatusCode::BAD_REQUEST, "INVALID_PATTERN".to_string(), msg)
            }
            Self::Cache(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Cache.code().to_string(),
                err.to_string(),
            ),
        };

        (
            status,
            Json(json!({"success": false, "error": {"code": code, "message": message}})),
        )
            .into_response()
    }
}

impl From<ClassifiedError> for AppError {
    fn from(err: ClassifiedError) -> Self {
        Self::Rejected(err)
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn body(kind: Option<ErrorKind>) -> ErrorBody {
        ErrorBody {
            message: "x".to_string(),
            kind,
            code: "X".to_string(),
            retryable: true,
            retry_after_seconds: None,
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&body(Some(ErrorKind::Validation))), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&body(Some(ErrorKind::Auth))), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&body(Some(ErrorKind::Quota))), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(&body(Some(ErrorKind::RateLimit))), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(&body(Some(ErrorKind::Timeout))), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&body(Some(ErrorKind::Network))), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&body(Some(ErrorKind::Generic))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for(&body(None)), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_user_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_of(&headers), None);
        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        assert_eq!(user_of(&headers), None);
        headers.insert(USER_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(user_of(&headers).as_deref(), Some("alice"));
    }

    #[test]
    fn test_app_error_status() {
        let response = AppError::from(ClassifiedError::validation("empty batch")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::from(CacheError::InvalidPattern("empty".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_quota_reply_has_retry_after() {
        let mut response = ServiceResponse {
            success: false,
            data: None,
            error: Some(body(Some(ErrorKind::Quota))),
            source: pulse_coordinator::Source::Error,
            cached: false,
            response_time_ms: 3,
        };
        if let Some(error) = response.error.as_mut() {
            error.retry_after_seconds = Some(120);
        }

        let reply = query_reply(response);
        assert_eq!(reply.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(reply.headers()[header::RETRY_AFTER], "120");
    }
}
