use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as RecordLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::runtime::record::JobRecord;
use crate::runtime::types::{JobError, JobId, JobParameters, ResultSummary};

/// Keyed storage for job records.
///
/// Every mutating method is atomic per record: a concurrent reader observes
/// either the state before or after the change, never a mix.  Mutations on
/// different ids do not contend with each other.
///
/// The default implementation is [`InMemoryJobStore`].  Durable stores
/// implement the same trait and are handed to the
/// [`JobService`](crate::api::JobService) as `Arc<dyn JobStore>`.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Allocate a fresh id and insert a `Pending` record.
    async fn create(&self, parameters: JobParameters) -> Result<JobRecord, JobError>;

    async fn get(&self, id: &JobId) -> Result<JobRecord, JobError>;

    /// Most recently created records first.
    async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, JobError>;

    /// `Pending -> Running`.
    async fn mark_running(&self, id: &JobId) -> Result<JobRecord, JobError>;

    /// Record progress on a running job.  Decreasing values are a no-op.
    async fn update_progress(
        &self,
        id: &JobId,
        progress: u8,
        step: Option<&str>,
    ) -> Result<JobRecord, JobError>;

    /// Set the cancellation intent flag on a running job.
    async fn request_cancel(&self, id: &JobId) -> Result<JobRecord, JobError>;

    async fn complete(&self, id: &JobId, summary: ResultSummary) -> Result<JobRecord, JobError>;

    async fn fail(&self, id: &JobId, detail: &str) -> Result<JobRecord, JobError>;

    async fn cancel(&self, id: &JobId) -> Result<JobRecord, JobError>;

    /// Fail every `Pending` or `Running` record.  Called once at startup to
    /// close out jobs whose supervisor died with the previous process.
    async fn interrupt_unfinished(&self, detail: &str) -> Result<u64, JobError>;
}

impl std::fmt::Debug for dyn JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn JobStore")
    }
}

type Entry = Arc<RecordLock<JobRecord>>;

#[derive(Debug, Default)]
struct Records {
    /// Insertion order, so records created within the same clock tick still
    /// list deterministically.
    next_seq: u64,
    by_id: HashMap<JobId, (u64, Entry)>,
}

/// Process-local [`JobStore`].
///
/// The id → record map sits behind a `tokio::sync::RwLock` that is only held
/// for lookups and inserts.  Each record has its own lock, so progress updates
/// of different jobs proceed in parallel.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<RwLock<Records>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &JobId) -> Result<Entry, JobError> {
        self.inner
            .read()
            .await
            .by_id
            .get(id)
            .map(|(_, entry)| Arc::clone(entry))
            .ok_or_else(|| JobError::NotFound { id: id.clone() })
    }

    /// Apply `change` to a copy of the record and publish it only on success.
    async fn mutate<F>(&self, id: &JobId, change: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord, DateTime<Utc>) -> Result<(), JobError>,
    {
        let entry = self.entry(id).await?;
        let mut guard = entry.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        change(&mut next, Utc::now())?;
        *guard = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, parameters: JobParameters) -> Result<JobRecord, JobError> {
        let mut records = self.inner.write().await;
        let mut id = JobId::generate();
        while records.by_id.contains_key(&id) {
            id = JobId::generate();
        }
        let record = JobRecord::new(id.clone(), parameters, Utc::now());
        let seq = records.next_seq;
        records.next_seq += 1;
        records
            .by_id
            .insert(id, (seq, Arc::new(RecordLock::new(record.clone()))));
        Ok(record)
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let entry = self.entry(id).await?;
        let record = entry.read().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(record)
    }

    async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, JobError> {
        let entries: Vec<(u64, Entry)> = self.inner.read().await.by_id.values().cloned().collect();
        let mut records: Vec<(u64, JobRecord)> = entries
            .iter()
            .map(|(seq, e)| (*seq, e.read().unwrap_or_else(PoisonError::into_inner).clone()))
            .collect();
        records.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        Ok(records
            .into_iter()
            .take(limit)
            .map(|(_, record)| record)
            .collect())
    }

    async fn mark_running(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.mutate(id, |r, now| r.start(now)).await
    }

    async fn update_progress(
        &self,
        id: &JobId,
        progress: u8,
        step: Option<&str>,
    ) -> Result<JobRecord, JobError> {
        self.mutate(id, |r, now| r.advance(progress, step, now).map(|_| ()))
            .await
    }

    async fn request_cancel(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.mutate(id, |r, now| r.request_cancel(now)).await
    }

    async fn complete(&self, id: &JobId, summary: ResultSummary) -> Result<JobRecord, JobError> {
        self.mutate(id, |r, now| r.complete(summary, now)).await
    }

    async fn fail(&self, id: &JobId, detail: &str) -> Result<JobRecord, JobError> {
        self.mutate(id, |r, now| r.fail(detail, now)).await
    }

    async fn cancel(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.mutate(id, |r, now| r.cancel(now)).await
    }

    async fn interrupt_unfinished(&self, detail: &str) -> Result<u64, JobError> {
        let entries: Vec<Entry> = self
            .inner
            .read()
            .await
            .by_id
            .values()
            .map(|(_, entry)| Arc::clone(entry))
            .collect();
        let now = Utc::now();
        let mut interrupted = 0;
        for entry in entries {
            let mut guard = entry.write().unwrap_or_else(PoisonError::into_inner);
            if guard.interrupt(detail, now) {
                interrupted += 1;
            }
        }
        Ok(interrupted)
    }
}
