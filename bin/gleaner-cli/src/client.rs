//! HTTP client for the gleaner-server job API.

use std::time::Duration;

use async_trait::async_trait;
use gleaner_core::{JobError, JobId, JobParameters, JobRecord, JobStatus, StatusSource};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, timeout or body decoding failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server address cannot carry an API path.
    #[error("invalid server URL '{0}'")]
    InvalidUrl(String),

    /// The server answered with a non-2xx status.
    #[error("server returned {status}: {message}")]
    Api { status: StatusCode, message: String },
}

impl ClientError {
    /// Classify for the status poller: only server-side and transport
    /// failures are worth retrying.
    pub fn into_job_error(self, id: &JobId) -> JobError {
        match self {
            ClientError::Api {
                status: StatusCode::NOT_FOUND,
                ..
            } => JobError::NotFound { id: id.clone() },
            ClientError::Api { status, message } if status.is_client_error() => {
                JobError::Validation(message)
            }
            other => JobError::Unavailable(other.to_string()),
        }
    }
}

/// Body of a `202 Accepted` submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accepted {
    pub id: JobId,
    pub status: JobStatus,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpJobClient {
    base: Url,
    client: Client,
}

impl HttpJobClient {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base = Url::parse(base).map_err(|e| ClientError::InvalidUrl(format!("{base}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base.to_string()));
        }
        let client = Client::builder()
            .user_agent(concat!("gleaner-cli/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { base, client })
    }

    /// `{base}/v1/{segments...}`, each segment percent-encoded on its own.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1").extend(segments);
        }
        url
    }

    pub async fn submit(&self, params: &JobParameters) -> Result<Accepted, ClientError> {
        let resp = self.client.post(self.url(&["jobs"])).json(params).send().await?;
        decode(resp).await
    }

    pub async fn status(&self, id: &JobId) -> Result<JobRecord, ClientError> {
        let resp = self.client.get(self.url(&["jobs", id.as_str()])).send().await?;
        decode(resp).await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord, ClientError> {
        let resp = self
            .client
            .post(self.url(&["jobs", id.as_str(), "cancel"]))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, ClientError> {
        let mut url = self.url(&["jobs"]);
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        let resp = self.client.get(url).send().await?;
        decode(resp).await
    }
}

#[async_trait]
impl StatusSource for HttpJobClient {
    async fn fetch_status(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.status(id).await.map_err(|e| e.into_job_error(id))
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_owned(),
    };
    Err(ClientError::Api { status, message })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::Utc;
    use gleaner_core::{PollConfig, ResultSummary, StatusPoller};
    use serde_json::json;

    use super::*;

    fn api(status: StatusCode) -> ClientError {
        ClientError::Api {
            status,
            message: "boom".to_owned(),
        }
    }

    #[test]
    fn only_server_errors_are_transient() {
        let id = JobId::from("J1");
        assert_eq!(
            api(StatusCode::NOT_FOUND).into_job_error(&id),
            JobError::NotFound { id: id.clone() }
        );
        assert_eq!(
            api(StatusCode::BAD_REQUEST).into_job_error(&id),
            JobError::Validation("boom".into())
        );
        assert!(matches!(
            api(StatusCode::SERVICE_UNAVAILABLE).into_job_error(&id),
            JobError::Unavailable(_)
        ));
    }

    #[test]
    fn ids_are_sent_as_a_single_path_segment() {
        let client = HttpJobClient::new("http://jobs.internal:8080/api/", Duration::from_secs(1)).unwrap();
        let url = client.url(&["jobs", "a/b?x#y", "cancel"]);
        assert_eq!(url.as_str(), "http://jobs.internal:8080/api/v1/jobs/a%2Fb%3Fx%23y/cancel");

        let url = client.url(&["jobs", "J7"]);
        assert_eq!(url.path_segments().unwrap().collect::<Vec<_>>(), ["api", "v1", "jobs", "J7"]);
    }

    #[test]
    fn base_without_trailing_slash_keeps_its_path() {
        let client = HttpJobClient::new("http://127.0.0.1:3001", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url(&["jobs"]).as_str(), "http://127.0.0.1:3001/v1/jobs");

        let client = HttpJobClient::new("http://host/prefix", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url(&["jobs"]).as_str(), "http://host/prefix/v1/jobs");
    }

    #[test]
    fn unusable_server_urls_are_rejected() {
        for bad in ["not a url", "mailto:ops@example.com"] {
            assert!(matches!(
                HttpJobClient::new(bad, Duration::from_secs(1)),
                Err(ClientError::InvalidUrl(_))
            ));
        }
    }

    /// Serves `GET /v1/jobs/{id}`: a 503 first, then running, then completed.
    async fn flaky_server() -> String {
        async fn job(State(calls): State<Arc<AtomicUsize>>, Path(id): Path<String>) -> axum::response::Response {
            let now = Utc::now();
            let mut record = JobRecord::new(JobId::from(id), JobParameters::new("cafe", "Rennes"), now);
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => (
                    AxumStatus::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "job store unavailable" })),
                )
                    .into_response(),
                1 => {
                    record.start(now).unwrap();
                    Json(record).into_response()
                }
                _ => {
                    record.start(now).unwrap();
                    record.complete(ResultSummary::new(6, 6), now).unwrap();
                    Json(record).into_response()
                }
            }
        }

        let app = Router::new()
            .route("/v1/jobs/{id}", get(job))
            .with_state(Arc::new(AtomicUsize::new(0)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn poller_rides_out_a_503_over_http() {
        let base = flaky_server().await;
        let client = HttpJobClient::new(&base, Duration::from_secs(5)).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let record = StatusPoller::new(client, PollConfig::fixed(Duration::from_millis(10)))
            .on_progress(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .wait(&JobId::from("J42"))
            .await
            .unwrap();

        assert_eq!(record.id, JobId::from("J42"));
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result_summary, Some(ResultSummary::new(6, 6)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn api_errors_carry_the_server_message() {
        let base = flaky_server().await;
        let client = HttpJobClient::new(&base, Duration::from_secs(5)).unwrap();

        let err = client.status(&JobId::from("J1")).await.unwrap_err();
        match err {
            ClientError::Api { status, message } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(message, "job store unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Unrouted path: axum's plain-text 404 falls back to the reason phrase.
        let err = client.cancel(&JobId::from("J1")).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: StatusCode::NOT_FOUND, .. }));
    }

    #[tokio::test]
    async fn reserved_characters_in_ids_reach_the_server_intact() {
        let base = flaky_server().await;
        let client = HttpJobClient::new(&base, Duration::from_secs(5)).unwrap();
        let _ = client.status(&JobId::from("warm-up")).await;

        let id = JobId::from("J1/../cancel?limit=1");
        let record = client.status(&id).await.unwrap();
        assert_eq!(record.id, id);
    }
}
