// crates/jobs/src/record.rs
//! Durable job records on top of a `StateStore`.
//!
//! Layout:
//! - `backup_job:{id}`: JSON `JobRecord`, expires `JOB_TTL` after the last write
//! - `backup_job_logs:{id}`: list of JSON `LogEntry`, same retention
//! - `backup_jobs_list`: sorted set of job IDs scored by creation time

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use vault_backup_store::StateStore;

use crate::error::JobResult;
use crate::types::{JobRecord, JobStatus, JobUpdate, LogEntry, LogLevel};

const JOB_PREFIX: &str = "backup_job:";
const JOB_LOGS_PREFIX: &str = "backup_job_logs:";
const JOB_INDEX_KEY: &str = "backup_jobs_list";

/// Retention window for job records and their logs.
pub const JOB_TTL: Duration = Duration::from_secs(86_400 * 7);

fn job_key(id: &str) -> String {
    format!("{JOB_PREFIX}{id}")
}

fn logs_key(id: &str) -> String {
    format!("{JOB_LOGS_PREFIX}{id}")
}

/// Index score for a timestamp: fractional seconds since the Unix epoch.
fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Job records, logs and the recency index.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn StateStore>,
}

impl JobStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// The backing state store.
    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Allocate a new job in `Pending` and index it.
    pub async fn create(&self) -> JobResult<JobRecord> {
        let id = Uuid::new_v4().to_string();
        let job = JobRecord::pending(id.clone(), Utc::now());

        self.write(&job).await?;
        self.store.zadd(JOB_INDEX_KEY, &id, score(job.created_at)).await?;
        self.store.del(&[logs_key(&id)]).await?;

        tracing::debug!(job_id = %id, "job created");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> JobResult<Option<JobRecord>> {
        match self.store.get(&job_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write a job. Returns the stored record, or `None` if the
    /// job does not exist.
    ///
    /// Updates the state machine refuses are dropped whole; the returned
    /// record then shows the unchanged state.
    pub async fn update(&self, id: &str, update: JobUpdate) -> JobResult<Option<JobRecord>> {
        let Some(mut job) = self.get(id).await? else {
            return Ok(None);
        };
        let requested = update.status;
        if !job.apply(update, Utc::now()) {
            tracing::warn!(
                job_id = %id,
                current = %job.status,
                requested = ?requested,
                "rejected job update"
            );
            return Ok(Some(job));
        }
        self.write(&job).await?;
        Ok(Some(job))
    }

    async fn write(&self, job: &JobRecord) -> JobResult<()> {
        let raw = serde_json::to_string(job)?;
        self.store.set_ex(&job_key(&job.id), &raw, JOB_TTL).await?;
        Ok(())
    }

    /// Append a timestamped log line.
    pub async fn append_log(&self, id: &str, level: LogLevel, message: impl Into<String>) -> JobResult<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        let key = logs_key(id);
        self.store.rpush(&key, &serde_json::to_string(&entry)?).await?;
        self.store.expire(&key, JOB_TTL).await?;
        Ok(())
    }

    /// Log entries in the inclusive index range `[start, end]`; `end = -1`
    /// reads through the last entry.
    pub async fn list_logs(&self, id: &str, start: i64, end: i64) -> JobResult<Vec<LogEntry>> {
        let raw = self.store.lrange(&logs_key(id), start, end).await?;
        raw.iter()
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    /// Entries appended at or after `since`, plus the cursor for the next call.
    pub async fn list_new_logs(&self, id: &str, since: usize) -> JobResult<(Vec<LogEntry>, usize)> {
        let logs = self.list_logs(id, since as i64, -1).await?;
        let next = since + logs.len();
        Ok((logs, next))
    }

    /// Up to `limit` most recently created jobs, newest first.
    pub async fn list_recent(&self, limit: usize) -> JobResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self.store.zrevrange(JOB_INDEX_KEY, 0, limit as i64 - 1).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            // Index entries outlive records whose TTL has lapsed.
            if let Some(job) = self.get(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Move a pending or running job to `Cancelled`.
    ///
    /// Returns false, writing nothing, when the job is missing or in any other
    /// status.
    pub async fn cancel(&self, id: &str) -> JobResult<bool> {
        let Some(job) = self.get(id).await? else {
            return Ok(false);
        };
        if !job.status.is_cancellable() {
            return Ok(false);
        }
        let updated = self.update(id, JobUpdate::new().status(JobStatus::Cancelled)).await?;
        Ok(updated.is_some_and(|j| j.status == JobStatus::Cancelled))
    }

    /// Delete every job created more than `max_age` ago, with its logs.
    /// Returns how many jobs were removed from the index.
    pub async fn sweep(&self, max_age: Duration) -> JobResult<u64> {
        // An age beyond chrono's range reaches past every job.
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(0);
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Ok(0);
        };
        let cutoff = score(cutoff);

        let stale = self.store.zrangebyscore(JOB_INDEX_KEY, 0.0, cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = stale
            .iter()
            .flat_map(|id| [job_key(id), logs_key(id)])
            .collect();
        self.store.del(&keys).await?;
        let removed = self.store.zremrangebyscore(JOB_INDEX_KEY, 0.0, cutoff).await?;

        tracing::info!(removed, "swept old backup jobs");
        Ok(removed)
    }
}
