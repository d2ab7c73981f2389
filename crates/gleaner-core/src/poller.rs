//! Client-side bounded polling of a job until it reaches a terminal state.
//!
//! [`StatusPoller`] repeatedly asks a [`StatusSource`] for a job's record,
//! sleeping between attempts according to a [`Backoff`].  It gives up after
//! a configurable number of attempts or amount of elapsed time, and can be
//! stopped early through a [`CancellationToken`].  Giving up never touches
//! the job itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::record::JobRecord;
use crate::runtime::types::{JobError, JobId};

/// Anything that can report the current record of a job.
///
/// Implemented in process by [`JobService`](crate::api::JobService) and over
/// HTTP by the command-line client.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch the current record of `id`.
    ///
    /// Return [`JobError::Unavailable`] for transient failures the poller
    /// should retry; every other error ends polling.
    async fn fetch_status(&self, id: &JobId) -> Result<JobRecord, JobError>;
}

#[async_trait]
impl<T> StatusSource for Arc<T>
where
    T: StatusSource + ?Sized,
{
    async fn fetch_status(&self, id: &JobId) -> Result<JobRecord, JobError> {
        (**self).fetch_status(id).await
    }
}

/// Delay schedule between two polling attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay after every attempt.
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: u32,
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait after the `attempt`-th attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1);
                initial
                    .saturating_mul(multiplier.saturating_pow(exponent))
                    .min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(2))
    }
}

/// Limits and pacing of a [`StatusPoller`].
///
/// At least one of `max_attempts` and `max_elapsed` should be set, otherwise
/// polling a job that never finishes only ends through cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub backoff: Backoff,
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: None,
            max_elapsed: Some(Duration::from_secs(600)),
        }
    }
}

impl PollConfig {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(interval),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    pub fn without_max_elapsed(mut self) -> Self {
        self.max_elapsed = None;
        self
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    /// The polling budget ran out before the job finished.  The job itself
    /// is unaffected and may still complete later.
    #[error("job still not finished after {attempts} attempts ({}ms)", .elapsed.as_millis())]
    Timeout {
        attempts: u32,
        elapsed: Duration,
        /// Last record seen, if any attempt succeeded.
        last: Option<Box<JobRecord>>,
    },

    /// The caller stopped polling.
    #[error("polling cancelled")]
    Cancelled,

    /// The status source returned a non-transient error.
    #[error(transparent)]
    Source(#[from] JobError),
}

type ProgressCallback = Box<dyn Fn(&JobRecord) + Send + Sync>;

/// Polls a [`StatusSource`] until the job is terminal or a limit is hit.
pub struct StatusPoller<S> {
    source: S,
    config: PollConfig,
    on_progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl<S> std::fmt::Debug for StatusPoller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPoller")
            .field("config", &self.config)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S: StatusSource> StatusPoller<S> {
    pub fn new(source: S, config: PollConfig) -> Self {
        Self {
            source,
            config,
            on_progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Invoke `callback` with every non-terminal record observed.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobRecord) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Stop polling with [`PollError::Cancelled`] once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops this poller when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll `id` until it is `Completed`, `Failed` or `Cancelled`.
    ///
    /// # Errors
    ///
    /// - [`PollError::Timeout`] – `max_attempts` or `max_elapsed` exhausted.
    /// - [`PollError::Cancelled`] – the cancellation token fired.
    /// - [`PollError::Source`] – the source failed with anything other than
    ///   [`JobError::Unavailable`].
    pub async fn wait(&self, id: &JobId) -> Result<JobRecord, PollError> {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut last: Option<JobRecord> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }
            attempts += 1;

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PollError::Cancelled),
                fetched = self.source.fetch_status(id) => fetched,
            };
            match fetched {
                Ok(record) if record.is_terminal() => {
                    debug!(job_id = %id, attempts, status = %record.status, "job finished");
                    return Ok(record);
                }
                Ok(record) => {
                    if let Some(callback) = &self.on_progress {
                        callback(&record);
                    }
                    last = Some(record);
                }
                Err(JobError::Unavailable(reason)) => {
                    warn!(job_id = %id, attempts, %reason, "status source unavailable, retrying");
                }
                Err(e) => return Err(PollError::Source(e)),
            }

            let elapsed = started.elapsed();
            let attempts_spent = self.config.max_attempts.is_some_and(|max| attempts >= max);
            let time_spent = self.config.max_elapsed.is_some_and(|max| elapsed >= max);
            if attempts_spent || time_spent {
                return Err(PollError::Timeout {
                    attempts,
                    elapsed,
                    last: last.map(Box::new),
                });
            }

            let mut delay = self.config.backoff.delay(attempts);
            if let Some(max) = self.config.max_elapsed {
                // One last attempt lands exactly on the deadline.
                delay = delay.min(max.saturating_sub(elapsed));
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
