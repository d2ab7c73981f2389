//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use gleaner_core::{DEFAULT_EXECUTION_TIMEOUT, DEFAULT_HISTORY_LIMIT};

/// Runtime configuration for gleaner-server.
///
/// Every field has a default so the server runs without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3001"`).
    pub bind_address: String,

    /// `"memory"` for the process-local store, or a sqlx SQLite URL such as
    /// `"sqlite://gleaner.db"` for a durable one.
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily-rolling log files.  Console only when unset.
    pub log_dir: Option<String>,

    /// Per-job execution budget enforced by the supervisor.
    pub execution_timeout: Duration,

    /// Default page size of `GET /v1/jobs`.
    pub history_limit: usize,

    /// Interval between two progress events on `GET /v1/jobs/{id}/events`.
    pub events_interval: Duration,

    /// Pause between the phases of the built-in simulated extractor.
    pub simulated_step: Duration,

    /// Serve Swagger UI at `/swagger-ui`.
    pub enable_swagger: bool,

    /// Comma-separated list of allowed CORS origins.  Any origin when unset.
    pub cors_allowed_origins: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3001".to_owned(),
            database_url: "memory".to_owned(),
            log_level: "info".to_owned(),
            log_json: false,
            log_dir: None,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            events_interval: Duration::from_millis(2000),
            simulated_step: Duration::from_millis(250),
            enable_swagger: true,
            cors_allowed_origins: None,
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: env_or("GLEANER_BIND", &defaults.bind_address),
            database_url: env_or("GLEANER_DATABASE_URL", &defaults.database_url),
            log_level: env_or("GLEANER_LOG", &defaults.log_level),
            log_json: env_flag("GLEANER_LOG_JSON", defaults.log_json),
            log_dir: env_opt("GLEANER_LOG_DIR"),
            execution_timeout: Duration::from_secs(parse_env(
                "GLEANER_EXECUTION_TIMEOUT_SECS",
                defaults.execution_timeout.as_secs(),
            )),
            history_limit: parse_env("GLEANER_HISTORY_LIMIT", defaults.history_limit),
            events_interval: Duration::from_millis(parse_env(
                "GLEANER_EVENTS_INTERVAL_MS",
                defaults.events_interval.as_millis() as u64,
            )),
            simulated_step: Duration::from_millis(parse_env(
                "GLEANER_SIMULATED_STEP_MS",
                defaults.simulated_step.as_millis() as u64,
            )),
            enable_swagger: env_flag("GLEANER_ENABLE_SWAGGER", defaults.enable_swagger),
            cors_allowed_origins: env_opt("GLEANER_CORS_ORIGINS"),
        }
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.eq_ignore_ascii_case("memory")
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
