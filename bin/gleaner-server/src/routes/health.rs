//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

/// Register health-check routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Heartbeat endpoint.
///
/// Returns `{"status": "ok", "version": "...", "active_jobs": n}` with HTTP
/// 200, where `active_jobs` counts jobs currently under supervision.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = Value)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status":      "ok",
        "version":     env!("CARGO_PKG_VERSION"),
        "active_jobs": state.jobs.supervisor().active_jobs(),
    }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use axum::http::StatusCode;
    use gleaner_core::{JobParameters, ProgressReporter, ResultSummary, WorkUnitError};

    use crate::routes::test_support::{app, get, send_json};

    async fn idle(_params: JobParameters, _progress: ProgressReporter) -> Result<ResultSummary, WorkUnitError> {
        std::future::pending().await
    }

    #[tokio::test]
    async fn health_reports_version_and_active_jobs() {
        let (app, state) = app(idle);
        state.jobs.submit(JobParameters::new("florist", "Nice")).await.unwrap();

        let (status, body) = send_json(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(!body["version"].as_str().unwrap_or("").is_empty());
        assert_eq!(body["active_jobs"], 1);
    }
}
