/// HTTP server setup and routing
use crate::{
    context::AppContext,
    error::{MetadataError, MetadataResult},
    metrics,
};
use axum::{
    extract::{MatchedPath, Request},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the main application router
/// Returns Router<()> because state is already provided
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(crate::api::routes())
        .route_layer(middleware::from_fn(track_http_metrics))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// Record every routed request under its route template
async fn track_http_metrics(req: Request, next: Next) -> Response {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().to_string();

    let response = next.run(req).await;
    metrics::record_http_request(&method, &path, response.status().as_u16());
    response
}

/// Prometheus scrape endpoint
async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server, stopping when `shutdown` completes
pub async fn serve<F>(ctx: AppContext, shutdown: F) -> MetadataResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    info!("Federation metadata resolver listening on {}", addr);
    info!("   Resolver: {}", ctx.resolver.id());
    info!("   Service URL: {}", ctx.service_url());

    let app = build_router(ctx);

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MetadataError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| MetadataError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
