use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use serde::Serialize;

use crate::AppState;
use crate::db::DbStats;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let active_generations = state.multiplexer.active_count().await as u64;
    let metrics = state.metrics.snapshot();

    // Every recent generation failing points at the text-generation service
    let failing = metrics.generations.failed + metrics.generations.stalled;
    let status = if failing > 0 && metrics.generations.completed == 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        active_generations,
        streams: metrics.streams.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 if the server is ready to accept requests
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = state.db.pool.acquire().await.is_ok();

    if db_ok {
        Json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        )
            .into_response()
    }
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub data_dir: String,
    #[serde(flatten)]
    pub db: DbStats,
}

/// Database row counts, for operators.
pub async fn stats_handler(State(state): State<AppState>) -> Response {
    match state.db.get_stats().await {
        Ok(db) => Json(StatsResponse {
            data_dir: state.config.data_dir.display().to_string(),
            db,
        })
        .into_response(),
        Err(e) => crate::error::ChatError::Internal(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(health_live_handler))
            .route("/health/ready", get(health_ready_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/admin/stats", get(stats_handler))
            .with_state(state)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_healthy_when_idle() {
        let (state, _tmp) = test_helpers::test_app_state().await;
        let (status, body) = get_json(app(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_generations"], 0);
    }

    #[tokio::test]
    async fn health_degrades_when_nothing_completes() {
        let (state, _tmp) = test_helpers::test_app_state().await;
        state.metrics.generation_started();
        state.metrics.generation_failed();
        let (_, body) = get_json(app(state), "/health").await;
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn liveness_readiness_and_metrics() {
        let (state, _tmp) = test_helpers::test_app_state().await;
        let router = app(state);

        let (status, body) = get_json(router.clone(), "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");

        let (status, body) = get_json(router.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "connected");

        let (status, body) = get_json(router.clone(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generations"]["started"], 0);
        assert!(body.get("fanout").is_some());

        let (status, body) = get_json(router, "/api/admin/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"], 0);
        assert!(body["data_dir"].is_string());
    }
}
