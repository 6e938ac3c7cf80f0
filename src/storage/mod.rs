//! The storage contract: a hot store for live coordination and an
//! optional cold store for long-term archival of terminal jobs.
//!
//! Backends are capability traits shared as `Arc<dyn Storage>` /
//! `Arc<dyn LongTermStorage>`; [`MemoryStorage`] and [`MemoryArchive`] are
//! the reference implementations and the test backends.

mod archive;
mod memory;

pub use archive::MemoryArchive;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{BackgroundJob, DistributedLockItem, Job, JobLog, JobStatus, Server};

/// The three lists of job ids pending promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ScheduleList {
    /// One-shot jobs with a future `start_at`.
    Scheduled,
    /// Pattern-driven jobs, promoted every time their pattern matches.
    Recurring,
    /// Jobs waiting on an antecedent background job to finish.
    Waiting,
}

/// One background job bundled with its owning job and usage logs, the unit
/// migrated from the hot store to the cold store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub job: Job,
    pub background_job: BackgroundJob,
    pub logs: Vec<JobLog>,
}

/// Per-day Processed/Failed totals for dashboard aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub processed: u64,
    pub failed: u64,
}

/// The hot store: low-latency queueing, indexing and coordination state.
///
/// Semantics every implementation must provide:
/// - queues are FIFO (enqueue at the tail, dequeue from the head,
///   non-blocking);
/// - a background job id is in exactly one status index at a time and a
///   status change moves it atomically;
/// - status indices insert at the newest end, so terminal indices are in
///   descending completion-time order (pagination and expiry scans rely on
///   this and stop at the first entry past their cutoff);
/// - transitioning a background job into Processed or Failed drains its
///   pending-dependents set into immediate enqueues.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists a job and returns its effective id.
    ///
    /// For a recurring job whose `name` is already registered the existing
    /// id is reused and the record updated in place, unless `force` is set
    /// (used by internal writers that already resolved the id).
    async fn save_job(&self, job: &Job, force: bool) -> Result<Uuid>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Deletes a job and cascades to all of its background jobs.
    async fn delete_job(&self, id: Uuid) -> Result<()>;

    /// Persists a background job, maintaining every derived structure:
    /// status indices, the owning job's attempt list, the queue on first
    /// enqueue, per-server processing lists, and the dependents drain on
    /// terminal transitions.
    async fn save_background_job(&self, background_job: &BackgroundJob) -> Result<()>;

    async fn get_background_job(&self, id: Uuid) -> Result<Option<BackgroundJob>>;

    /// Deletes a background job and its logs. When this was the owning
    /// job's last background job and that job is non-recurring and
    /// inactive, the job record is deleted too.
    async fn delete_background_job(&self, id: Uuid) -> Result<()>;

    /// Most recent background job of a job, if any.
    async fn latest_background_job(&self, job_id: Uuid) -> Result<Option<BackgroundJob>>;

    /// Ids of a job's background jobs, newest first.
    async fn background_job_ids(&self, job_id: Uuid) -> Result<Vec<Uuid>>;

    /// Pops the head of a queue. `None` when the queue is empty.
    async fn dequeue(&self, queue: &str) -> Result<Option<Uuid>>;

    /// Promotion bookkeeping: removes the job from its pending schedule
    /// entries and invalidates the queue's schedule snapshot.
    async fn job_enqueued(&self, job_id: Uuid, queue: &str) -> Result<()>;

    /// Registers `job_id` as a dependent of `background_job_id`. When the
    /// antecedent is already terminal (or gone) the dependent is promoted
    /// immediately; returns whether that immediate promotion happened.
    async fn enqueue_after(&self, job_id: Uuid, background_job_id: Uuid) -> Result<bool>;

    /// Pages through one of the pending-promotion lists.
    async fn scheduled_jobs(&self, list: ScheduleList, from: usize, count: usize)
        -> Result<Vec<Job>>;

    async fn scheduled_jobs_count(&self, list: ScheduleList) -> Result<usize>;

    /// The queue's due-job snapshot. Reading marks `server_id` as having
    /// pulled the current snapshot; see [`schedule_changed`].
    ///
    /// [`schedule_changed`]: Storage::schedule_changed
    async fn queue_schedule(&self, server_id: Uuid, queue: &str) -> Result<Vec<Job>>;

    /// Whether the queue's schedule snapshot changed since `server_id`
    /// last pulled it. Writers invalidate the snapshot for every server.
    async fn schedule_changed(&self, server_id: Uuid, queue: &str) -> Result<bool>;

    /// Resolves a recurring job's unique name to its id.
    async fn recurring_job_id(&self, name: &str) -> Result<Option<Uuid>>;

    async fn append_log(&self, background_job_id: Uuid, log: &JobLog) -> Result<()>;

    async fn logs(&self, background_job_id: Uuid) -> Result<Vec<JobLog>>;

    /// Registers or refreshes a server record with the given time-to-live.
    async fn save_server(&self, server: &Server, ttl: Duration) -> Result<()>;

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>>;

    /// All registered servers with a live record and a recent heartbeat.
    async fn servers(&self) -> Result<Vec<Server>>;

    /// Heartbeat reconciliation: merges the local server state with the
    /// persisted record (persisted `status` wins, `last_activity` is
    /// refreshed) and returns the merged record.
    async fn sync_server(&self, server: &Server, ttl: Duration) -> Result<Server>;

    /// Whether any background job claimed by this server is still listed
    /// as processing.
    async fn has_running_jobs(&self, server_id: Uuid) -> Result<bool>;

    /// Writes (or refreshes) a lock ticket record and appends it to its
    /// key's FIFO if not already present.
    async fn save_distributed_lock(&self, item: &DistributedLockItem) -> Result<()>;

    /// Whether ticket `id` currently holds the lock on `key`: true iff it
    /// is the head of the key's FIFO. A stale head (no heartbeat for
    /// `inactive_timeout`) is evicted and the check repeated.
    async fn is_distributed_lock_entered(
        &self,
        key: &str,
        id: &str,
        inactive_timeout: Duration,
    ) -> Result<bool>;

    /// Removes a ticket from its key's FIFO and deletes its record.
    async fn delete_distributed_lock(&self, id: &str) -> Result<()>;

    /// Evicts every ticket whose heartbeat is older than
    /// `inactive_timeout`; returns how many were evicted.
    async fn evict_stale_locks(&self, inactive_timeout: Duration) -> Result<usize>;

    async fn all_distributed_locks(&self) -> Result<Vec<DistributedLockItem>>;

    /// Pages a status index, newest first.
    async fn status_index(&self, status: JobStatus, from: usize, count: usize)
        -> Result<Vec<Uuid>>;

    async fn background_jobs_count(&self, status: JobStatus) -> Result<usize>;

    /// Names of all queues that currently exist in the store.
    async fn queues(&self) -> Result<Vec<String>>;

    async fn queue_jobs_count(&self, queue: &str) -> Result<usize>;

    /// Per-day Processed/Failed totals back to `since`, scanning the
    /// ordered terminal indices newest-first and stopping at the first
    /// entry older than `since`.
    async fn daily_status(&self, since: NaiveDate) -> Result<Vec<DailyCount>>;

    /// Every key in the store, for diagnostics.
    async fn all_keys(&self) -> Result<Vec<String>>;

    /// Deletes terminal background jobs completed before `cutoff`,
    /// scanning each terminal index from its oldest end and stopping at
    /// the first entry inside the cutoff. Returns how many were deleted.
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Wipes everything except the server registry and live lock state.
    async fn delete_all(&self) -> Result<()>;
}

/// The cold store: a durable archive for terminal background jobs,
/// write-populated only by batch migration.
#[async_trait]
pub trait LongTermStorage: Send + Sync {
    /// Bulk upsert of one migration batch.
    async fn save_background_jobs(&self, batch: &[ArchiveEntry]) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn get_background_job(&self, id: Uuid) -> Result<Option<BackgroundJob>>;

    async fn latest_background_job(&self, job_id: Uuid) -> Result<Option<BackgroundJob>>;

    async fn background_jobs_count(&self, status: JobStatus) -> Result<usize>;

    /// Pages background jobs of one status, newest first.
    async fn list(&self, status: JobStatus, from: usize, count: usize)
        -> Result<Vec<BackgroundJob>>;

    /// Case-insensitive search over job id, name, target and serialized
    /// argument values.
    async fn search(&self, term: &str) -> Result<Vec<BackgroundJob>>;

    async fn daily_status(&self, since: NaiveDate) -> Result<Vec<DailyCount>>;

    async fn logs(&self, background_job_id: Uuid) -> Result<Vec<JobLog>>;

    async fn delete_background_job(&self, id: Uuid) -> Result<()>;

    /// Deletes archived background jobs completed before `cutoff`.
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn delete_all(&self) -> Result<()>;
}

impl ScheduleList {
    pub(crate) fn key(self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Recurring => "Recurring",
            Self::Waiting => "Waiting",
        }
    }
}
