//! HTTP server implementation using axum.

use crate::error::ServerError;
use crate::server::AppState;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod handlers;

/// Create HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/metrics", get(handlers::handle_metrics))
        .route("/v1/query", post(handlers::handle_query))
        .route("/v1/batch", post(handlers::handle_batch))
        .route("/v1/stats", get(handlers::handle_stats))
        .route("/v1/admin/cache/clear", post(handlers::handle_clear_cache))
        .route(
            "/v1/admin/cache/invalidate/{target}",
            post(handlers::handle_invalidate_target),
        )
        .route("/v1/admin/warm", post(handlers::handle_warm))
        .route(
            "/v1/admin/optimizations",
            get(handlers::handle_get_optimizations).post(handlers::handle_set_optimizations),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already-bound listener.
///
/// # Errors
///
/// Returns `ServerError` if the server stops with an I/O error.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<AppState>) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("HTTP server listening on {}", addr);
    }
    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| ServerError::Shutdown(format!("HTTP server error: {e}")))
}

/// Bind and start the HTTP server.
///
/// # Errors
///
/// Returns `ServerError` if the server fails to bind or encounters a runtime error.
pub async fn start_server(bind_addr: SocketAddr, state: Arc<AppState>) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ServerError::HttpBindFailed {
            addr: bind_addr,
            source,
        })?;
    serve(listener, state).await
}
