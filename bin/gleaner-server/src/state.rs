//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use gleaner_core::JobService;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Submission, status and cancellation of extraction jobs.
    pub jobs: JobService,
}

impl AppState {
    pub fn new(config: Config, jobs: JobService) -> Self {
        Self {
            config: Arc::new(config),
            jobs,
        }
    }
}
