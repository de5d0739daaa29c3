/// Health check endpoints for liveness and readiness probes
///
/// Readiness means the resolver is initialized; the response carries the
/// full-pull refresh status so operators can see stale sources.
use crate::{context::AppContext, metrics, store::RefreshStatus};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall status: "healthy", "degraded", or "unhealthy"
    pub status: String,

    /// Application version
    pub version: String,

    /// Uptime in seconds
    pub uptime_seconds: f64,

    /// Individual component checks
    pub checks: Vec<ComponentHealth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health status of individual component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,

    /// Status: "healthy", "degraded", or "unhealthy"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/health/detailed", get(health_detailed))
}

/// Basic health check
pub async fn health_basic() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Liveness probe: responding at all means alive
pub async fn liveness_probe() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness probe
///
/// 200 once the resolver is initialized, 503 before that or after shutdown.
pub async fn readiness_probe(
    State(ctx): State<AppContext>,
) -> (StatusCode, Json<serde_json::Value>) {
    let refresh = ctx.resolver.refresh_status();
    if !ctx.resolver.is_initialized() {
        tracing::warn!("readiness_probe_failed: resolver not initialized");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "resolver": ctx.resolver.id(),
                "refresh": refresh,
            })),
        );
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ready",
            "version": env!("CARGO_PKG_VERSION"),
            "resolver": ctx.resolver.id(),
            "entities": ctx.resolver.store().len(),
            "refresh": refresh,
        })),
    )
}

/// Detailed health check with all component statuses
pub async fn health_detailed(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let checks = vec![check_resolver(&ctx), check_artifacts(&ctx).await];
    let overall_status = determine_overall_status(&checks);

    let uptime = ctx.uptime().as_secs_f64();
    metrics::UPTIME_SECONDS.set(uptime);

    let health = HealthStatus {
        status: overall_status.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        checks,
        message: if overall_status == "healthy" {
            None
        } else {
            Some("One or more components are unhealthy".to_string())
        },
    };

    let status_code = match overall_status.as_str() {
        "unhealthy" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status_code, Json(health))
}

fn check_resolver(ctx: &AppContext) -> ComponentHealth {
    let refresh = ctx.resolver.refresh_status();
    let status = resolver_status(ctx.resolver.is_initialized(), &refresh);
    ComponentHealth {
        name: "resolver".to_string(),
        status: status.to_string(),
        response_time_ms: None,
        error: refresh.last_error.clone(),
        details: Some(serde_json::json!({
            "id": ctx.resolver.id(),
            "entities": ctx.resolver.store().len(),
            "refresh": refresh,
        })),
    }
}

/// A failed last refresh still serves the previous snapshot
fn resolver_status(initialized: bool, refresh: &RefreshStatus) -> &'static str {
    if !initialized {
        "unhealthy"
    } else if refresh.last_error.is_some() {
        "degraded"
    } else {
        "healthy"
    }
}

async fn check_artifacts(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    match ctx.artifacts.contains("health-check-probe").await {
        Ok(_) => ComponentHealth {
            name: "artifact_map".to_string(),
            status: "healthy".to_string(),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
            details: None,
        },
        Err(e) => ComponentHealth {
            name: "artifact_map".to_string(),
            status: "unhealthy".to_string(),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
            error: Some(e.to_string()),
            details: None,
        },
    }
}

/// Determine overall health status from individual checks
fn determine_overall_status(checks: &[ComponentHealth]) -> String {
    let unhealthy_count = checks.iter().filter(|c| c.status == "unhealthy").count();
    let degraded_count = checks.iter().filter(|c| c.status == "degraded").count();

    if unhealthy_count > 0 {
        "unhealthy".to_string()
    } else if degraded_count > 0 {
        "degraded".to_string()
    } else {
        "healthy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(status: &str) -> ComponentHealth {
        ComponentHealth {
            name: "component".to_string(),
            status: status.to_string(),
            response_time_ms: Some(1),
            error: None,
            details: None,
        }
    }

    #[test]
    fn test_determine_overall_status() {
        assert_eq!(determine_overall_status(&[check("healthy"), check("healthy")]), "healthy");
        assert_eq!(determine_overall_status(&[check("healthy"), check("degraded")]), "degraded");
        assert_eq!(
            determine_overall_status(&[check("degraded"), check("unhealthy")]),
            "unhealthy"
        );
    }

    #[test]
    fn test_failed_refresh_degrades_resolver() {
        let mut refresh = RefreshStatus::default();
        assert_eq!(resolver_status(true, &refresh), "healthy");
        assert_eq!(resolver_status(false, &refresh), "unhealthy");

        refresh.last_error = Some("origin down".to_string());
        assert_eq!(resolver_status(true, &refresh), "degraded");
    }
}
