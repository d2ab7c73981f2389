//! Extraction job endpoints.
//!
//! Jobs are submitted here and executed in the background by the
//! [`JobService`](gleaner_core::JobService) supervisor.  Clients follow a
//! job either by polling `GET /v1/jobs/{id}` or by subscribing to the
//! server-sent event stream at `GET /v1/jobs/{id}/events`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use gleaner_core::{
    JobId, JobParameters, JobRecord, JobStatus, PollConfig, PollError, ResultSummary, StatusPoller,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};
use utoipa::OpenApi;
use validator::Validate;

use crate::error::ServerError;
use crate::schemas::v1::job::{ListJobsQuery, SubmitJobRequest, SubmitJobResponse};
use crate::state::AppState;

/// Upper bound on `?limit=` for the history listing.
const MAX_LIST_LIMIT: usize = 100;

#[derive(OpenApi)]
#[openapi(
    paths(submit_job, list_jobs, get_job, cancel_job, job_events),
    components(schemas(
        SubmitJobRequest,
        SubmitJobResponse,
        ListJobsQuery,
        JobRecord,
        JobParameters,
        JobStatus,
        ResultSummary,
        JobId
    ))
)]
pub struct JobsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/events", get(job_events))
}

#[utoipa::path(
    post,
    path = "/v1/jobs",
    tag = "jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 202, description = "Job accepted", body = SubmitJobResponse),
        (status = 400, description = "Missing or invalid parameters"),
        (status = 503, description = "Job store unavailable"),
    )
)]
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ServerError> {
    let Json(req) = payload?;
    req.validate()?;

    let record = state.jobs.submit(req.into_parameters()).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse::from(&record))))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    tag = "jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Most recent jobs first", body = [JobRecord]),
        (status = 503, description = "Job store unavailable"),
    )
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobRecord>>, ServerError> {
    let limit = q
        .limit
        .unwrap_or(state.config.history_limit)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.jobs.list(limit).await?))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    tag = "jobs",
    params(
        ("id" = String, Path, description = "ID of the job to retrieve")
    ),
    responses(
        (status = 200, description = "Current job record", body = JobRecord),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ServerError> {
    Ok(Json(state.jobs.status(&JobId::from(id)).await?))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/cancel",
    tag = "jobs",
    params(
        ("id" = String, Path, description = "ID of the job to cancel")
    ),
    responses(
        (status = 200, description = "Cancelled, or cancellation requested for a running job", body = JobRecord),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job already finished"),
    )
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ServerError> {
    Ok(Json(state.jobs.cancel(&JobId::from(id)).await?))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/events",
    tag = "jobs",
    params(
        ("id" = String, Path, description = "ID of the job to follow")
    ),
    responses(
        (status = 200, description = "`progress` events, then one event named after the terminal status",
            content_type = "text/event-stream", body = JobRecord),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let id = JobId::from(id);
    state.jobs.status(&id).await?;

    // The job cannot outlive its execution budget, so neither does the stream.
    let config = PollConfig::fixed(state.config.events_interval)
        .with_max_elapsed(state.config.execution_timeout + state.config.events_interval * 2);
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();

    let progress_tx = tx.clone();
    let poller = StatusPoller::new(state.jobs.clone(), config)
        .with_cancellation(token.clone())
        .on_progress(move |record| {
            let _ = progress_tx.send(record_event("progress", record));
        });

    tokio::spawn(
        async move {
            let last = match poller.wait(&id).await {
                Ok(record) => record_event(record.status.as_str(), &record),
                Err(PollError::Cancelled) => {
                    debug!(job_id = %id, "event stream closed by client");
                    return;
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "event stream gave up");
                    Event::default()
                        .event("error")
                        .data(json!({ "error": e.to_string() }).to_string())
                }
            };
            let _ = tx.send(last);
        }
        .in_current_span(),
    );

    // Dropping the response stream stops the poller.
    let guard = token.drop_guard();
    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _alive = &guard;
        Ok::<_, Infallible>(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn record_event(name: &str, record: &JobRecord) -> Event {
    Event::default()
        .event(name)
        .json_data(record)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use gleaner_core::{ProgressReporter, WorkUnitError};
    use serde_json::Value;

    use super::*;
    use crate::routes::test_support::{app, get, post_json, send, send_json};

    async fn quick(_params: JobParameters, progress: ProgressReporter) -> Result<ResultSummary, WorkUnitError> {
        progress.report(50, "scraping");
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ResultSummary::new(9, 3))
    }

    async fn stuck(_params: JobParameters, progress: ProgressReporter) -> Result<ResultSummary, WorkUnitError> {
        progress.report(5, "initializing browser");
        std::future::pending().await
    }

    async fn wait_for_status(app: &Router, id: &str, wanted: &str) -> Value {
        for _ in 0..200 {
            let (_, body) = send_json(app, get(&format!("/v1/jobs/{id}"))).await;
            if body["status"] == wanted {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {wanted}");
    }

    #[tokio::test]
    async fn submit_returns_202_and_job_is_queryable() {
        let (app, _) = app(quick);

        let (status, body) = send_json(
            &app,
            post_json("/v1/jobs", json!({ "keyword": "restaurant", "city": "Paris" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        let id = body["id"].as_str().unwrap().to_owned();

        let (status, record) = send_json(&app, get(&format!("/v1/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["id"], id.as_str());
        assert_eq!(record["parameters"]["radius"], 10);

        let done = wait_for_status(&app, &id, "completed").await;
        assert_eq!(done["progress"], 100);
        assert_eq!(done["result_summary"]["count"], 9);
        assert!(done.get("error_detail").is_none());
    }

    #[tokio::test]
    async fn missing_city_is_a_400() {
        let (app, state) = app(quick);
        let (status, body) = send_json(&app, post_json("/v1/jobs", json!({ "keyword": "restaurant" }))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "city is required");
        assert!(state.jobs.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_keyword_and_malformed_bodies_are_400s() {
        let (app, _) = app(quick);

        let (status, body) =
            send_json(&app, post_json("/v1/jobs", json!({ "keyword": "  ", "city": "Paris" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "keyword is required");

        let request = Request::post("/v1/jobs")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_job_is_a_404() {
        let (app, _) = app(quick);
        let (status, body) = send_json(&app, get("/v1/jobs/J999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "job not found: J999");

        let (status, _) = send_json(&app, post_json("/v1/jobs/J999/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(&app, get("/v1/jobs/J999/events")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancelling_twice_is_a_409() {
        let (app, _) = app(stuck);
        let (_, body) = send_json(
            &app,
            post_json("/v1/jobs", json!({ "keyword": "plumber", "city": "Lille" })),
        )
        .await;
        let id = body["id"].as_str().unwrap().to_owned();
        wait_for_status(&app, &id, "running").await;

        let (status, _) = send_json(&app, post_json(&format!("/v1/jobs/{id}/cancel"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        wait_for_status(&app, &id, "cancelled").await;

        let (status, body) =
            send_json(&app, post_json(&format!("/v1/jobs/{id}/cancel"), json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("cancelled -> cancelled"));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let (app, _) = app(stuck);
        for city in ["Paris", "Lyon", "Nantes"] {
            send_json(&app, post_json("/v1/jobs", json!({ "keyword": "bakery", "city": city }))).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let (status, body) = send_json(&app, get("/v1/jobs?limit=2")).await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["parameters"]["city"], "Nantes");
        assert_eq!(jobs[1]["parameters"]["city"], "Lyon");
    }

    #[tokio::test]
    async fn event_stream_ends_with_the_terminal_record() {
        let (app, _) = app(quick);
        let (_, body) = send_json(
            &app,
            post_json("/v1/jobs", json!({ "keyword": "restaurant", "city": "Paris" })),
        )
        .await;
        let id = body["id"].as_str().unwrap().to_owned();

        let (status, headers, stream) = send(&app, get(&format!("/v1/jobs/{id}/events"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            headers["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        assert!(stream.contains("event: completed"));
        assert!(stream.contains(r#""status":"completed""#));
        assert_eq!(stream.matches("event: completed").count(), 1);
    }

    #[tokio::test]
    async fn trace_id_is_echoed() {
        let (app, _) = app(quick);
        let trace_id = "7f8c1a52-9d3e-4b1a-8c51-0e2f3a4b5c6d";
        let request = Request::get("/health")
            .header("x-trace-id", trace_id)
            .body(Body::empty())
            .unwrap();

        let (_, headers, _) = send(&app, request).await;
        assert_eq!(headers["x-trace-id"], trace_id);

        let (_, headers, _) = send(&app, get("/health")).await;
        assert!(headers.contains_key("x-trace-id"));
    }
}
