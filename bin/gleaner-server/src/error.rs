//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors turn into a JSON body
//! `{"error": "..."}` with the matching status code.
//!
//! Store failures are logged with full detail but only a generic message is
//! returned to the caller.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gleaner_core::JobError;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use validator::ValidationErrors;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the job service.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The request body could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<ValidationErrors> for ServerError {
    fn from(errors: ValidationErrors) -> Self {
        ServerError::Job(JobError::from(errors))
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Job(JobError::Validation(m)) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Job(e @ JobError::NotFound { .. }) => (StatusCode::NOT_FOUND, e.to_string()),
            ServerError::Job(e @ JobError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, e.to_string())
            }
            ServerError::Job(JobError::Unavailable(detail)) => {
                error!(error = %detail, "job store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "job store unavailable".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
