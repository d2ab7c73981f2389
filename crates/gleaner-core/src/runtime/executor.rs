use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::runtime::types::{JobParameters, ResultSummary};

/// Opaque failure reported by a [`WorkUnit`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WorkUnitError {
    message: String,
}

impl WorkUnitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for WorkUnitError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for WorkUnitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Latest progress reported by a work unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub step: Option<String>,
}

/// Handle a work unit uses to publish progress and observe cancellation.
///
/// Reports are coalesced: the supervisor only ever sees the most recent one,
/// so a fast work unit cannot build up a backlog.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Progress>>,
    cancel_rx: watch::Receiver<bool>,
}

impl ProgressReporter {
    pub(crate) fn new(tx: watch::Sender<Progress>, cancel_rx: watch::Receiver<bool>) -> Self {
        Self {
            tx: Arc::new(tx),
            cancel_rx,
        }
    }

    /// A reporter connected to nothing.  Useful for running a work unit
    /// outside a supervisor.
    pub fn detached() -> Self {
        let (tx, _) = watch::channel(Progress::default());
        let (_, cancel_rx) = watch::channel(false);
        Self::new(tx, cancel_rx)
    }

    /// Publish `percent` (clamped to 100) together with a step description.
    pub fn report(&self, percent: u8, step: impl Into<String>) {
        self.tx.send_replace(Progress {
            percent: percent.min(100),
            step: Some(step.into()),
        });
    }

    /// Publish `percent` without changing the step description.
    pub fn set_percent(&self, percent: u8) {
        self.tx.send_modify(|p| p.percent = percent.min(100));
    }

    /// The most recently published progress.
    pub fn current(&self) -> Progress {
        self.tx.borrow().clone()
    }

    /// Whether cancellation of this job has been requested.
    ///
    /// Long-running work units should check this between steps and return
    /// early; the supervisor aborts them regardless.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation is requested.  Never resolves for a
    /// detached reporter.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// The pluggable unit of work executed for each job.
///
/// Implementations perform the actual extraction and report progress through
/// the supplied [`ProgressReporter`].  Closures of the shape
/// `Fn(JobParameters, ProgressReporter) -> impl Future<Output = Result<..>>`
/// implement this trait directly.
#[async_trait]
pub trait WorkUnit: Send + Sync + 'static {
    async fn execute(
        &self,
        parameters: JobParameters,
        progress: ProgressReporter,
    ) -> Result<ResultSummary, WorkUnitError>;
}

#[async_trait]
impl<F, Fut> WorkUnit for F
where
    F: Fn(JobParameters, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResultSummary, WorkUnitError>> + Send + 'static,
{
    async fn execute(
        &self,
        parameters: JobParameters,
        progress: ProgressReporter,
    ) -> Result<ResultSummary, WorkUnitError> {
        (self)(parameters, progress).await
    }
}
