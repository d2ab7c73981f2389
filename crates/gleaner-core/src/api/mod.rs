//! Public-facing submission API.
//!
//! [`JobService`] is the only entry point callers need: it validates and
//! records submissions, hands them to the [`WorkerSupervisor`], answers status
//! queries and routes cancellation requests.
//!
//! # Quick-start
//!
//! ```rust,no_run
//! use gleaner_core::api::JobService;
//! use gleaner_core::{JobParameters, ProgressReporter, ResultSummary, SupervisorConfig, WorkUnitError};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let service = JobService::in_memory(
//!     |params: JobParameters, progress: ProgressReporter| async move {
//!         progress.report(50, format!("searching {}", params.city));
//!         Ok::<_, WorkUnitError>(ResultSummary::new(12, 4))
//!     },
//!     SupervisorConfig::default(),
//! );
//!
//! let job = service
//!     .submit(JobParameters::new("restaurant", "Paris"))
//!     .await
//!     .unwrap();
//! let current = service.status(&job.id).await.unwrap();
//! println!("{} is {}", current.id, current.status);
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use validator::Validate;

use crate::poller::StatusSource;
use crate::runtime::executor::WorkUnit;
use crate::runtime::record::JobRecord;
use crate::runtime::storage::{InMemoryJobStore, JobStore};
use crate::runtime::supervisor::{SupervisorConfig, WorkerSupervisor};
use crate::runtime::types::{JobError, JobId, JobParameters, JobStatus};

/// Default number of records returned by [`JobService::list`].
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Submission, status and cancellation front-end over a [`JobStore`].
///
/// Cheap to clone; clones share the store and the supervisor.
#[derive(Clone, Debug)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    supervisor: WorkerSupervisor,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        work_unit: Arc<dyn WorkUnit>,
        config: SupervisorConfig,
    ) -> Self {
        let supervisor = WorkerSupervisor::new(Arc::clone(&store), work_unit, config);
        Self { store, supervisor }
    }

    /// A service backed by a fresh [`InMemoryJobStore`].
    pub fn in_memory(work_unit: impl WorkUnit, config: SupervisorConfig) -> Self {
        Self::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(work_unit),
            config,
        )
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Validate `parameters`, create a `Pending` record and schedule its
    /// execution.
    ///
    /// Returns as soon as the record exists; the work runs in the background.
    /// The returned record is the freshly created one, so its status is
    /// always `Pending`.
    ///
    /// # Errors
    ///
    /// - [`JobError::Validation`] – a required field is missing or out of
    ///   range.  Nothing is recorded.
    pub async fn submit(&self, parameters: JobParameters) -> Result<JobRecord, JobError> {
        let parameters = parameters.normalized();
        parameters.validate()?;

        let record = self.store.create(parameters.clone()).await?;
        // The handle is dropped on purpose: the job outlives this call.
        self.supervisor.start(record.id.clone(), parameters)?;

        info!(
            job_id = %record.id,
            keyword = %record.parameters.keyword,
            city = %record.parameters.city,
            "job submitted"
        );
        Ok(record)
    }

    /// Snapshot of a job.
    pub async fn status(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.store.get(id).await
    }

    /// Most recent jobs first, at most `limit` of them.
    pub async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, JobError> {
        self.store.list(limit).await
    }

    /// Request cancellation of a job.
    ///
    /// A `Pending` job is cancelled on the spot.  A `Running` job is flagged
    /// and its supervisor signalled; the record turns `Cancelled` once the
    /// supervisor has stopped the work unit, so the returned snapshot may
    /// still read `Running` with `cancel_requested` set.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] – unknown id.
    /// - [`JobError::InvalidTransition`] – the job is already terminal.
    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let record = self.store.get(id).await?;
        match record.status {
            JobStatus::Pending => {
                // Also valid if the supervisor picked the job up in between;
                // the signal then stops the work unit it just started.
                let cancelled = self.store.cancel(id).await?;
                self.supervisor.signal_cancel(id);
                info!(job_id = %id, "pending job cancelled");
                Ok(cancelled)
            }
            JobStatus::Running => self.cancel_running(id).await,
            from => Err(JobError::InvalidTransition {
                id: id.clone(),
                from,
                to: JobStatus::Cancelled,
            }),
        }
    }

    async fn cancel_running(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let flagged = self.store.request_cancel(id).await?;
        if self.supervisor.signal_cancel(id) {
            info!(job_id = %id, "cancellation requested");
            Ok(flagged)
        } else {
            // Nobody is executing this record any more; close it out here.
            info!(job_id = %id, "cancelling unsupervised job");
            self.store.cancel(id).await
        }
    }
}

#[async_trait]
impl StatusSource for JobService {
    async fn fetch_status(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.status(id).await
    }
}

#[cfg(test)]
mod tests;
