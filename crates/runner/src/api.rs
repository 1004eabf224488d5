//! HTTP API for suite progress and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bench_lib::progress::ProgressRegistry;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub progress: ProgressRegistry,
}

impl AppState {
    pub fn new(progress: ProgressRegistry) -> Self {
        Self { progress }
    }
}

/// Liveness: the runner answers as long as the process is up
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// Per-scenario phase and status of the running suite
async fn progress(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.progress.snapshot().await)
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/progress", get(progress))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use bench_lib::models::ScenarioStatus;
    use bench_lib::observability::BenchMetrics;
    use tower::ServiceExt;

    async fn setup_test_app() -> (Router, Arc<AppState>) {
        let progress = ProgressRegistry::new("swarm");
        progress.register("fault-tolerance").await;
        progress.register("rolling-update").await;

        let state = Arc::new(AppState::new(progress));
        (create_router(state.clone()), state)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (app, _state) = setup_test_app().await;

        let (status, body) = get_body(app, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
    }

    #[tokio::test]
    async fn test_progress_reports_scenarios() {
        let (app, state) = setup_test_app().await;
        state
            .progress
            .set_finished("fault-tolerance", ScenarioStatus::Passed, None)
            .await;
        state.progress.set_running("rolling-update").await;

        let (status, body) = get_body(app, "/progress").await;

        assert_eq!(status, StatusCode::OK);
        let progress: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(progress["platform"], "swarm");
        assert_eq!(progress["total"], 2);
        assert_eq!(progress["finished"], 1);
        assert_eq!(progress["complete"], false);
        assert_eq!(progress["scenarios"]["fault-tolerance"]["status"], "passed");
        assert_eq!(progress["scenarios"]["rolling-update"]["phase"], "running");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_prometheus_format() {
        let (app, _state) = setup_test_app().await;
        let metrics = BenchMetrics::new();
        metrics.scenario_finished("fault-tolerance", ScenarioStatus::Passed, 12.5);
        metrics.observe_request(true, 0.004);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let metrics_text = String::from_utf8(body.to_vec()).unwrap();
        assert!(metrics_text.contains("orchbench_scenario_duration_seconds_bucket"));
        assert!(metrics_text.contains("orchbench_scenario_results_total"));
        assert!(metrics_text.contains("orchbench_traffic_requests_total"));
    }
}
