//! gleaner-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise tracing (console, optionally JSON, plus an optional rolling file).
//! 3. Open the job store and mark jobs left over from a previous run as failed.
//! 4. Start the job service with the built-in extractor.
//! 5. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod db;
mod error;
mod executor;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use gleaner_core::{INTERRUPTED_DETAIL, InMemoryJobStore, JobService, JobStore, SupervisorConfig};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;
use crate::db::sqlite::SqliteJobStore;
use crate::executor::SimulatedExtractor;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "gleaner-server starting");

    // ── 3. Job store ───────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = if cfg.uses_memory_store() {
        info!("using in-memory job store; history is lost on restart");
        Arc::new(InMemoryJobStore::new())
    } else {
        let store = SqliteJobStore::connect(&cfg.database_url).await?;
        info!(database_url = %cfg.database_url, "database ready");
        Arc::new(store)
    };

    let interrupted = store.interrupt_unfinished(INTERRUPTED_DETAIL).await?;
    if interrupted > 0 {
        warn!(count = interrupted, "marked jobs from the previous run as failed");
    }

    // ── 4. Job service ─────────────────────────────────────────────────────────
    let jobs = JobService::new(
        store,
        Arc::new(SimulatedExtractor::new(cfg.simulated_step)),
        SupervisorConfig {
            execution_timeout: cfg.execution_timeout,
            ..SupervisorConfig::default()
        },
    );
    info!(
        execution_timeout_secs = cfg.execution_timeout.as_secs(),
        "job service ready"
    );

    let state = Arc::new(AppState::new(cfg.clone(), jobs));

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let active = state.jobs.supervisor().active_jobs();
    if active > 0 {
        warn!(active, "jobs still running at shutdown; they will be marked failed on next start");
    }
    info!("gleaner-server stopped");
    Ok(())
}

/// Install the global subscriber.  The returned guard flushes the file
/// writer and must live until `main` returns.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: GLEANER_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let stdout_layer = if cfg.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gleaner-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    guard
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
