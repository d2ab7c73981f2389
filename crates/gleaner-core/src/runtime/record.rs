use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::types::{JobError, JobId, JobParameters, JobStatus, ResultSummary};

/// The complete state of a single submitted job.
///
/// Mutations go through the transition methods below, which enforce the
/// [`JobStatus`] state machine and keep `updated_at` current.  Each method
/// either applies its whole change or returns an error and leaves the record
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct JobRecord {
    pub id: JobId,
    pub parameters: JobParameters,
    pub status: JobStatus,
    /// 0–100; only advances while `Running`.
    pub progress: u8,
    /// Human-readable description of the current phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Set when cancellation was requested but not yet honoured.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A fresh `Pending` record.
    pub fn new(id: JobId, parameters: JobParameters, now: DateTime<Utc>) -> Self {
        Self {
            id,
            parameters,
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            cancel_requested: false,
            result_summary: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure(&self, to: JobStatus) -> Result<(), JobError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }

    /// `Pending -> Running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.ensure(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(self.touch(now));
        Ok(())
    }

    /// Record progress for a running job.
    ///
    /// `progress` is clamped to 100.  A lower value than the current one is
    /// ignored, as is a repeat of the current value without a new step.
    /// Returns whether anything changed.
    pub fn advance(
        &mut self,
        progress: u8,
        step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, JobError> {
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: JobStatus::Running,
            });
        }
        let progress = progress.min(100);
        let step_changed = step.is_some_and(|s| self.current_step.as_deref() != Some(s));
        if progress < self.progress || (progress == self.progress && !step_changed) {
            return Ok(false);
        }
        self.progress = progress;
        if let Some(step) = step {
            self.current_step = Some(step.to_owned());
        }
        self.touch(now);
        Ok(true)
    }

    /// Flag a running job for cooperative cancellation.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: JobStatus::Cancelled,
            });
        }
        if !self.cancel_requested {
            self.cancel_requested = true;
            self.touch(now);
        }
        Ok(())
    }

    /// `Running -> Completed`; progress is pinned at 100.
    pub fn complete(&mut self, summary: ResultSummary, now: DateTime<Utc>) -> Result<(), JobError> {
        self.ensure(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result_summary = Some(summary);
        self.error_detail = None;
        self.finish(now);
        Ok(())
    }

    /// `Running -> Failed`; progress keeps its last value.
    pub fn fail(&mut self, detail: &str, now: DateTime<Utc>) -> Result<(), JobError> {
        self.ensure(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error_detail = Some(detail.to_owned());
        self.result_summary = None;
        self.finish(now);
        Ok(())
    }

    /// `Pending | Running -> Cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.ensure(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.finish(now);
        Ok(())
    }

    /// Fail a job orphaned by a previous process.
    ///
    /// Unlike [`fail`](Self::fail) this also accepts `Pending`.  Returns
    /// `false` for records that are already terminal.
    pub fn interrupt(&mut self, detail: &str, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error_detail = Some(detail.to_owned());
        self.finish(now);
        true
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.cancel_requested = false;
        self.finished_at = Some(self.touch(now));
    }

    /// Bump `updated_at` to `now`, never backwards.  Returns the new value.
    fn touch(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.updated_at = self.updated_at.max(now);
        self.updated_at
    }
}
