//! SQLite implementation of [`JobStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature.  Migrations are embedded at
//! compile time from `./migrations` and run by [`SqliteJobStore::connect`].
//!
//! Each state transition is a single `UPDATE ... WHERE status IN (...)
//! RETURNING` statement, so the check and the write happen atomically inside
//! SQLite.  When no row comes back, a follow-up read tells an unknown id apart
//! from a rejected transition.
//!
//! Timestamps are stored as fixed-width RFC 3339 text so that ordering by the
//! column matches chronological order.  Writes take `MAX(updated_at, now)`,
//! so a clock stepping backwards never moves `updated_at` back.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use gleaner_core::{JobError, JobId, JobParameters, JobRecord, JobStatus, JobStore, ResultSummary};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::error;

const COLUMNS: &str = "id, keyword, city, radius, max_results, status, progress, current_step, \
     cancel_requested, result_count, result_new_count, error_detail, created_at, updated_at, \
     started_at, finished_at";

/// Attempts at finding an unused id before giving up.
const CREATE_ATTEMPTS: usize = 3;

/// SQLite-backed job store.
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://gleaner.db"` or `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            // Every connection to `:memory:` is a separate database, so keep
            // exactly one alive for the lifetime of the pool.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(8);
        }

        let pool = pool_options.connect_with(options).await?;
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn fetch_row(&self, id: &JobId) -> Result<Option<JobRow>, JobError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)
    }

    /// Turn the outcome of a guarded `UPDATE ... RETURNING` into a result.
    async fn settle(
        &self,
        id: &JobId,
        to: JobStatus,
        updated: Option<JobRow>,
    ) -> Result<JobRecord, JobError> {
        match updated {
            Some(row) => row.into_record(),
            None => Err(self.rejection(id, to).await),
        }
    }

    async fn rejection(&self, id: &JobId, to: JobStatus) -> JobError {
        match self.fetch_row(id).await {
            Ok(Some(row)) => match row.status.parse::<JobStatus>() {
                Ok(from) => JobError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to,
                },
                Err(_) => corrupt("status", &row.status),
            },
            Ok(None) => JobError::NotFound { id: id.clone() },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, parameters: JobParameters) -> Result<JobRecord, JobError> {
        for _ in 0..CREATE_ATTEMPTS {
            let record = JobRecord::new(JobId::generate(), parameters.clone(), Utc::now());
            let inserted = sqlx::query(
                "INSERT INTO jobs (id, keyword, city, radius, max_results, status, progress, \
                 cancel_requested, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?7)",
            )
            .bind(record.id.as_str())
            .bind(&record.parameters.keyword)
            .bind(&record.parameters.city)
            .bind(i64::from(record.parameters.radius))
            .bind(i64::from(record.parameters.max_results))
            .bind(record.status.as_str())
            .bind(timestamp(record.created_at))
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => return Ok(record),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => continue,
                Err(e) => return Err(unavailable(e)),
            }
        }
        Err(JobError::Unavailable(
            "could not allocate a unique job id".to_owned(),
        ))
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.fetch_row(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: id.clone() })?
            .into_record()
    }

    async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, JobError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    async fn mark_running(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let to = JobStatus::Running;
        let sql = format!(
            "UPDATE jobs SET status = '{}', started_at = MAX(updated_at, ?1), updated_at = MAX(updated_at, ?1) \
             WHERE id = ?2 AND status IN ({}) RETURNING {COLUMNS}",
            to.as_str(),
            status_guard(to),
        );
        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(timestamp(Utc::now()))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        self.settle(id, to, updated).await
    }

    async fn update_progress(
        &self,
        id: &JobId,
        progress: u8,
        step: Option<&str>,
    ) -> Result<JobRecord, JobError> {
        // Lower values are ignored, as is the same value without a new step.
        let sql = format!(
            "UPDATE jobs SET progress = ?1, current_step = COALESCE(?2, current_step), updated_at = MAX(updated_at, ?3) \
             WHERE id = ?4 AND status = '{}' \
               AND (progress < ?1 OR (progress = ?1 AND ?2 IS NOT NULL AND current_step IS NOT ?2)) \
             RETURNING {COLUMNS}",
            JobStatus::Running.as_str(),
        );
        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(i64::from(progress.min(100)))
            .bind(step)
            .bind(timestamp(Utc::now()))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        if let Some(row) = updated {
            return row.into_record();
        }

        let current = self
            .fetch_row(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: id.clone() })?
            .into_record()?;
        if current.status == JobStatus::Running {
            Ok(current)
        } else {
            Err(JobError::InvalidTransition {
                id: id.clone(),
                from: current.status,
                to: JobStatus::Running,
            })
        }
    }

    async fn request_cancel(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let sql = format!(
            "UPDATE jobs SET updated_at = CASE WHEN cancel_requested = 0 THEN MAX(updated_at, ?1) ELSE updated_at END, \
             cancel_requested = 1 \
             WHERE id = ?2 AND status = '{}' RETURNING {COLUMNS}",
            JobStatus::Running.as_str(),
        );
        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(timestamp(Utc::now()))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        self.settle(id, JobStatus::Cancelled, updated).await
    }

    async fn complete(&self, id: &JobId, summary: ResultSummary) -> Result<JobRecord, JobError> {
        let to = JobStatus::Completed;
        let sql = format!(
            "UPDATE jobs SET status = '{}', progress = 100, result_count = ?1, result_new_count = ?2, \
             error_detail = NULL, cancel_requested = 0, finished_at = MAX(updated_at, ?3), updated_at = MAX(updated_at, ?3) \
             WHERE id = ?4 AND status IN ({}) RETURNING {COLUMNS}",
            to.as_str(),
            status_guard(to),
        );
        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(i64::try_from(summary.count).unwrap_or(i64::MAX))
            .bind(i64::try_from(summary.new_count).unwrap_or(i64::MAX))
            .bind(timestamp(Utc::now()))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        self.settle(id, to, updated).await
    }

    async fn fail(&self, id: &JobId, detail: &str) -> Result<JobRecord, JobError> {
        let to = JobStatus::Failed;
        let sql = format!(
            "UPDATE jobs SET status = '{}', error_detail = ?1, result_count = NULL, \
             result_new_count = NULL, cancel_requested = 0, finished_at = MAX(updated_at, ?2), updated_at = MAX(updated_at, ?2) \
             WHERE id = ?3 AND status IN ({}) RETURNING {COLUMNS}",
            to.as_str(),
            status_guard(to),
        );
        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(detail)
            .bind(timestamp(Utc::now()))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        self.settle(id, to, updated).await
    }

    async fn cancel(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let to = JobStatus::Cancelled;
        let sql = format!(
            "UPDATE jobs SET status = '{}', cancel_requested = 0, finished_at = MAX(updated_at, ?1), updated_at = MAX(updated_at, ?1) \
             WHERE id = ?2 AND status IN ({}) RETURNING {COLUMNS}",
            to.as_str(),
            status_guard(to),
        );
        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(timestamp(Utc::now()))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        self.settle(id, to, updated).await
    }

    async fn interrupt_unfinished(&self, detail: &str) -> Result<u64, JobError> {
        let sql = format!(
            "UPDATE jobs SET status = '{}', error_detail = ?1, cancel_requested = 0, \
             finished_at = MAX(updated_at, ?2), updated_at = MAX(updated_at, ?2) \
             WHERE status IN ('{}', '{}')",
            JobStatus::Failed.as_str(),
            JobStatus::Pending.as_str(),
            JobStatus::Running.as_str(),
        );
        let done = sqlx::query(&sql)
            .bind(detail)
            .bind(timestamp(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(done.rows_affected())
    }
}

/// A single row of the `jobs` table.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    keyword: String,
    city: String,
    radius: i64,
    max_results: i64,
    status: String,
    progress: i64,
    current_step: Option<String>,
    cancel_requested: bool,
    result_count: Option<i64>,
    result_new_count: Option<i64>,
    error_detail: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord, JobError> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|_| corrupt("status", &self.status))?;
        let result_summary = self.result_count.map(|count| {
            ResultSummary::new(
                u64::try_from(count).unwrap_or_default(),
                u64::try_from(self.result_new_count.unwrap_or_default()).unwrap_or_default(),
            )
        });

        Ok(JobRecord {
            id: JobId::from(self.id),
            parameters: JobParameters {
                keyword: self.keyword,
                city: self.city,
                radius: u32::try_from(self.radius).map_err(|_| corrupt("radius", &self.radius.to_string()))?,
                max_results: u32::try_from(self.max_results)
                    .map_err(|_| corrupt("max_results", &self.max_results.to_string()))?,
            },
            status,
            progress: self.progress.clamp(0, 100) as u8,
            current_step: self.current_step,
            cancel_requested: self.cancel_requested,
            result_summary,
            error_detail: self.error_detail,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

/// `'pending', 'running'`-style list of the states `to` may be entered from.
fn status_guard(to: JobStatus) -> String {
    JobStatus::sources_of(to)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, JobError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", raw))
}

fn corrupt(column: &str, raw: &str) -> JobError {
    error!(column, raw, "corrupt job row");
    JobError::Unavailable(format!("corrupt {column} in job row: {raw}"))
}

fn unavailable(e: sqlx::Error) -> JobError {
    error!(error = %e, "job store query failed");
    JobError::Unavailable(e.to_string())
}
