use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, error, info, info_span, warn};

use crate::poller::Backoff;
use crate::runtime::executor::{Progress, ProgressReporter, WorkUnit};
use crate::runtime::storage::JobStore;
use crate::runtime::record::JobRecord;
use crate::runtime::types::{ExecutionError, JobError, JobId, JobParameters, JobStatus, ResultSummary};

/// Default per-job execution budget.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Tuning knobs for the [`WorkerSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Hard limit on a single execution.  Exceeding it fails the job.
    pub execution_timeout: Duration,
    /// Attempts at a lifecycle write (start or outcome) while the store
    /// reports [`JobError::Unavailable`].
    pub store_retry_attempts: u32,
    /// Delay between those attempts.
    pub store_retry_backoff: Backoff,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            store_retry_attempts: 8,
            store_retry_backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                multiplier: 2,
                max: Duration::from_secs(5),
            },
        }
    }
}

/// Cancellation senders of the jobs currently being supervised, keyed by id.
///
/// Presence in the map is what guarantees a single supervisor per job.
#[derive(Default)]
struct ActiveJobs {
    cancels: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl ActiveJobs {
    fn register(&self, id: &JobId) -> Result<watch::Receiver<bool>, JobError> {
        let mut map = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(id) {
            return Err(JobError::InvalidTransition {
                id: id.clone(),
                from: JobStatus::Running,
                to: JobStatus::Running,
            });
        }
        let (tx, rx) = watch::channel(false);
        map.insert(id.clone(), tx);
        Ok(rx)
    }

    fn signal(&self, id: &JobId) -> bool {
        let map = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: &JobId) -> bool {
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn remove(&self, id: &JobId) {
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn len(&self) -> usize {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for ActiveJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActiveJobs({} jobs)", self.len())
    }
}

/// How a supervised execution ended.
#[derive(Debug)]
enum Outcome {
    Completed(ResultSummary),
    Failed(ExecutionError),
    Cancelled,
    /// The record moved on without us (cancelled directly, or it vanished).
    /// Nothing left to write.
    Abandoned(JobError),
}

/// Runs one work unit per job in the background and mirrors its progress and
/// outcome into the [`JobStore`].
///
/// Each job gets its own tokio task; the work unit runs in a child task so a
/// panic or an abort never leaves the record stuck in `Running`.
#[derive(Clone)]
pub struct WorkerSupervisor {
    store: Arc<dyn JobStore>,
    work_unit: Arc<dyn WorkUnit>,
    config: SupervisorConfig,
    active: Arc<ActiveJobs>,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("config", &self.config)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl WorkerSupervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        work_unit: Arc<dyn WorkUnit>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            work_unit,
            config,
            active: Arc::new(ActiveJobs::default()),
        }
    }

    /// Begin supervising `id` in a background task and return its handle.
    ///
    /// Returns immediately.  Rejects a second start for an id that is still
    /// supervised with [`JobError::InvalidTransition`].
    pub fn start(&self, id: JobId, parameters: JobParameters) -> Result<JoinHandle<()>, JobError> {
        let cancel_rx = self.active.register(&id)?;
        let span = info_span!("job", job_id = %id);
        let this = self.clone();
        Ok(tokio::spawn(
            async move {
                let outcome = this.drive(&id, parameters, cancel_rx).await;
                this.finalize(&id, outcome).await;
                this.active.remove(&id);
            }
            .instrument(span),
        ))
    }

    /// Ask the supervisor of `id` to stop.  Returns `false` if no supervisor
    /// is running for that id.
    pub fn signal_cancel(&self, id: &JobId) -> bool {
        self.active.signal(id)
    }

    pub fn is_supervising(&self, id: &JobId) -> bool {
        self.active.contains(id)
    }

    /// Number of jobs currently being supervised.
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    async fn drive(
        &self,
        id: &JobId,
        parameters: JobParameters,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Outcome {
        let store = &self.store;
        if let Err(e) = self.persist("start", move || store.mark_running(id)).await {
            return Outcome::Abandoned(e);
        }
        info!(keyword = %parameters.keyword, city = %parameters.city, "job running");

        let (progress_tx, mut progress_rx) = watch::channel(Progress::default());
        let reporter = ProgressReporter::new(progress_tx, cancel_rx.clone());
        let work_unit = Arc::clone(&self.work_unit);
        let mut work = tokio::spawn(async move { work_unit.execute(parameters, reporter).await });

        let limit = self.config.execution_timeout;
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        if *cancel_rx.borrow_and_update() {
            work.abort();
            return Outcome::Cancelled;
        }

        let mut cancel_open = true;
        let mut progress_open = true;
        loop {
            tokio::select! {
                biased;

                changed = cancel_rx.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel_rx.borrow_and_update() => {
                        work.abort();
                        return Outcome::Cancelled;
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },

                joined = &mut work => return match joined {
                    Ok(Ok(summary)) => Outcome::Completed(summary),
                    Ok(Err(e)) => Outcome::Failed(ExecutionError::WorkUnit(e.to_string())),
                    Err(e) => join_failure(e),
                },

                _ = &mut deadline => {
                    work.abort();
                    return Outcome::Failed(ExecutionError::Timeout { limit });
                }

                changed = progress_rx.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    let Progress { percent, step } = progress_rx.borrow_and_update().clone();
                    match self.store.update_progress(id, percent, step.as_deref()).await {
                        Ok(_) => {}
                        Err(e @ (JobError::InvalidTransition { .. } | JobError::NotFound { .. })) => {
                            work.abort();
                            return Outcome::Abandoned(e);
                        }
                        Err(e) => warn!(error = %e, "failed to record job progress"),
                    }
                }
            }
        }
    }

    async fn finalize(&self, id: &JobId, outcome: Outcome) {
        let store = &self.store;
        let result = match outcome {
            Outcome::Completed(summary) => self
                .persist("completion", move || store.complete(id, summary))
                .await
                .map(|_| {
                    info!(count = summary.count, new_count = summary.new_count, "job completed");
                }),
            Outcome::Failed(err) => {
                let message = err.to_string();
                warn!(error = %message, "job failed");
                let detail = message.as_str();
                self.persist("failure", move || store.fail(id, detail))
                    .await
                    .map(|_| ())
            }
            Outcome::Cancelled => match self.persist("cancellation", move || store.cancel(id)).await {
                Ok(_) => {
                    info!("job cancelled");
                    Ok(())
                }
                // Cancelled directly while still pending.
                Err(JobError::InvalidTransition {
                    from: JobStatus::Cancelled,
                    ..
                }) => Ok(()),
                Err(e) => Err(e),
            },
            Outcome::Abandoned(JobError::Unavailable(reason)) => {
                error!(%reason, "job store unavailable; job left pending until restart recovery");
                Ok(())
            }
            Outcome::Abandoned(reason) => {
                info!(reason = %reason, "job no longer owned by supervisor");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(error = %e, "failed to finalize job; left for restart recovery");
        }
    }

    /// Run a lifecycle write, retrying while the store is unavailable.
    async fn persist<F, Fut>(&self, what: &'static str, mut write: F) -> Result<JobRecord, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobRecord, JobError>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Err(JobError::Unavailable(reason)) if attempt < self.config.store_retry_attempts => {
                    let delay = self.config.store_retry_backoff.delay(attempt);
                    warn!(what, attempt, %reason, delay_ms = delay.as_millis() as u64, "job store unavailable, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn join_failure(err: JoinError) -> Outcome {
    if err.is_panic() {
        Outcome::Failed(ExecutionError::Panicked(panic_message(err.into_panic())))
    } else {
        Outcome::Cancelled
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
