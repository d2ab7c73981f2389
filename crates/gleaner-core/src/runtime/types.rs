use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

/// Unique identifier for a submitted job.
///
/// Generated from a random v4 UUID at creation time and never reused.  Any
/// string is accepted when parsing so that lookups of malformed ids surface as
/// [`JobError::NotFound`] instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_owned())
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// Pending ──► Running ──► Completed
///    │           ├──────► Failed
///    └───────────┴──────► Cancelled
/// ```
///
/// `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns `true` once no further transition is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
        )
    }

    /// Every state from which `target` may be entered.
    ///
    /// Durable stores use this to build the guard of a conditional update.
    pub fn sources_of(target: JobStatus) -> &'static [JobStatus] {
        match target {
            JobStatus::Pending => &[],
            JobStatus::Running => &[JobStatus::Pending],
            JobStatus::Completed | JobStatus::Failed => &[JobStatus::Running],
            JobStatus::Cancelled => &[JobStatus::Pending, JobStatus::Running],
        }
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

fn default_radius() -> u32 {
    10
}

fn default_max_results() -> u32 {
    20
}

/// Input to one extraction job: what to look for and where.
///
/// Immutable once the job record is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct JobParameters {
    /// Search keyword, e.g. `"restaurant"`.
    #[validate(length(min = 1, message = "keyword is required"))]
    pub keyword: String,
    /// City the search is scoped to.
    #[validate(length(min = 1, message = "city is required"))]
    pub city: String,
    /// Search radius in kilometres.
    #[serde(default = "default_radius")]
    #[validate(range(min = 1, max = 100, message = "radius must be between 1 and 100"))]
    pub radius: u32,
    /// Upper bound on the number of items the work unit should produce.
    #[serde(default = "default_max_results")]
    #[validate(range(min = 1, max = 100, message = "max_results must be between 1 and 100"))]
    pub max_results: u32,
}

impl JobParameters {
    pub fn new(keyword: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            city: city.into(),
            radius: default_radius(),
            max_results: default_max_results(),
        }
    }

    pub fn with_radius(mut self, radius: u32) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    /// Trim surrounding whitespace so blank fields fail validation.
    pub fn normalized(mut self) -> Self {
        self.keyword = self.keyword.trim().to_owned();
        self.city = self.city.trim().to_owned();
        self
    }
}

/// What a successful job produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ResultSummary {
    /// Number of items found.
    pub count: u64,
    /// How many of those were not seen before.
    #[serde(default)]
    pub new_count: u64,
}

impl ResultSummary {
    pub fn new(count: u64, new_count: u64) -> Self {
        Self { count, new_count }
    }
}

/// Errors surfaced synchronously by the store and the submission API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The submission was malformed; no record was created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced job does not exist.
    #[error("job not found: {id}")]
    NotFound { id: JobId },

    /// The requested change violates the job state machine.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The backing store (or a remote status source) could not be reached.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

impl From<ValidationErrors> for JobError {
    fn from(errors: ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(message) => message.to_string(),
                    None => format!("{field}: {}", e.code),
                })
            })
            .collect();
        messages.sort();
        JobError::Validation(messages.join("; "))
    }
}

/// Why a supervised execution ended in `Failed`.
///
/// Rendered with `Display` into the record's `error_detail`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The work unit returned an error.
    #[error("work unit failed: {0}")]
    WorkUnit(String),

    /// The execution budget was exceeded.
    #[error("execution timed out after {}s", .limit.as_secs())]
    Timeout { limit: Duration },

    /// The work unit panicked.
    #[error("work unit panicked: {0}")]
    Panicked(String),
}
