use gleaner_core::{JobId, JobParameters, JobRecord, JobStatus};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

/// Body of `POST /v1/jobs`.
///
/// `keyword` and `city` are optional at the JSON level so a missing field
/// surfaces as a validation error rather than a deserialization failure.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SubmitJobRequest {
    /// Search keyword, e.g. `"restaurant"`.
    #[validate(required(message = "keyword is required"))]
    pub keyword: Option<String>,
    /// City the search is scoped to.
    #[validate(required(message = "city is required"))]
    pub city: Option<String>,
    /// Search radius in kilometres (default 10).
    pub radius: Option<u32>,
    /// Upper bound on the number of places to extract (default 20).
    pub max_results: Option<u32>,
}

impl SubmitJobRequest {
    pub fn into_parameters(self) -> JobParameters {
        let mut parameters = JobParameters::new(
            self.keyword.unwrap_or_default(),
            self.city.unwrap_or_default(),
        );
        if let Some(radius) = self.radius {
            parameters = parameters.with_radius(radius);
        }
        if let Some(max_results) = self.max_results {
            parameters = parameters.with_max_results(max_results);
        }
        parameters
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitJobResponse {
    pub id: JobId,
    pub status: JobStatus,
}

impl From<&JobRecord> for SubmitJobResponse {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema, IntoParams)]
pub struct ListJobsQuery {
    /// Maximum number of jobs to return, newest first.
    pub limit: Option<usize>,
}
