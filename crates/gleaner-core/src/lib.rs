mod runtime;

pub mod api;
pub mod poller;

pub use api::{DEFAULT_HISTORY_LIMIT, JobService};
pub use poller::{Backoff, PollConfig, PollError, StatusPoller, StatusSource};
pub use runtime::executor::{Progress, ProgressReporter, WorkUnit, WorkUnitError};
pub use runtime::record::JobRecord;
pub use runtime::storage::{InMemoryJobStore, JobStore};
pub use runtime::supervisor::{DEFAULT_EXECUTION_TIMEOUT, SupervisorConfig, WorkerSupervisor};
pub use runtime::types::{ExecutionError, JobError, JobId, JobParameters, JobStatus, ResultSummary};

/// Detail recorded on jobs that were still in flight when the process stopped.
pub const INTERRUPTED_DETAIL: &str = "interrupted by server restart";
