//! The embedder-facing API for creating, chaining and controlling jobs.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::invocation::Invocation;
use crate::model::{BackgroundJob, Job, JobKind, JobStatus};
use crate::pattern::RecurringPattern;
use crate::storage::{LongTermStorage, Storage};

/// Enqueues, schedules and controls jobs against the shared stores.
///
/// Invalid definitions (empty target, recurring job without a name) are
/// rejected synchronously; nothing invalid is ever persisted.
#[derive(Clone)]
pub struct Client {
    config: Arc<Configuration>,
    storage: Arc<dyn Storage>,
    long_term: Option<Arc<dyn LongTermStorage>>,
}

impl Client {
    pub fn new(config: Arc<Configuration>, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            long_term: None,
        }
    }

    /// Attaches a cold store; `re_enqueue` falls back to it for records
    /// that already migrated out of the hot store.
    pub fn with_long_term(mut self, long_term: Arc<dyn LongTermStorage>) -> Self {
        self.long_term = Some(long_term);
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn long_term(&self) -> Option<&Arc<dyn LongTermStorage>> {
        self.long_term.as_ref()
    }

    /// Enqueues for immediate execution. Returns the background job id.
    pub async fn enqueue(&self, invocation: Invocation, kind: JobKind) -> Result<Uuid> {
        let mut job = Job::new(invocation, kind);
        job.active = false;
        self.storage.save_job(&job, false).await?;
        let background_job = BackgroundJob::enqueued(job.id);
        self.storage.save_background_job(&background_job).await?;
        debug!(job_id = %job.id, queue = job.queue, "job enqueued");
        Ok(background_job.id)
    }

    /// Schedules a one-shot job for promotion at `at`. Returns the job id.
    pub async fn schedule(
        &self,
        invocation: Invocation,
        kind: JobKind,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let job = Job::new(invocation, kind).with_start_at(at);
        let id = self.storage.save_job(&job, false).await?;
        debug!(job_id = %id, %at, "job scheduled");
        Ok(id)
    }

    /// Registers (or updates) a recurring job. Idempotent on `name`: a
    /// re-subscribe updates the existing entry's pattern and invocation in
    /// place and returns the same job id.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        invocation: Invocation,
        kind: JobKind,
        pattern: RecurringPattern,
    ) -> Result<Uuid> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidJob(
                "recurring jobs require a non-empty name".into(),
            ));
        }
        let job = Job::new(invocation, kind).with_recurring_pattern(name.clone(), pattern);
        let id = self.storage.save_job(&job, false).await?;
        info!(job_id = %id, name, "recurring job subscribed");
        Ok(id)
    }

    /// Creates a job promoted only once `antecedent_background_job_id`
    /// reaches a terminal status (immediately when it already has).
    /// Returns the new job id.
    pub async fn enqueue_after(
        &self,
        invocation: Invocation,
        kind: JobKind,
        antecedent_background_job_id: Uuid,
    ) -> Result<Uuid> {
        let job = Job::new(invocation, kind).with_antecedent(antecedent_background_job_id);
        self.storage.save_job(&job, false).await?;
        let promoted = self
            .storage
            .enqueue_after(job.id, antecedent_background_job_id)
            .await?;
        debug!(
            job_id = %job.id,
            antecedent = %antecedent_background_job_id,
            promoted,
            "dependent job registered"
        );
        Ok(job.id)
    }

    /// Promotes a pending job to its queue right now. `None` when the job
    /// does not exist. This is the path the scheduled-promotion loop uses.
    pub async fn enqueue_by_id(&self, job_id: Uuid) -> Result<Option<Uuid>> {
        let Some(mut job) = self.storage.get_job(job_id).await? else {
            return Ok(None);
        };
        job.active = false;
        self.storage.save_job(&job, true).await?;
        let background_job = BackgroundJob::enqueued(job.id);
        self.storage.save_background_job(&background_job).await?;
        self.storage.job_enqueued(job.id, &job.queue).await?;
        Ok(Some(background_job.id))
    }

    /// Runs a finished background job again. Canceled and Interrupted
    /// records are revived in place; Processed and Failed records get a
    /// fresh background job. In-flight records are left alone and their
    /// own id is returned. Falls back to the cold store for records that
    /// already migrated. `None` when nothing is found in either store.
    pub async fn re_enqueue(&self, background_job_id: Uuid) -> Result<Option<Uuid>> {
        if let Some(mut background_job) =
            self.storage.get_background_job(background_job_id).await?
        {
            return match background_job.status {
                JobStatus::Canceled | JobStatus::Interrupted => {
                    background_job.status = JobStatus::Enqueued;
                    background_job.error = None;
                    background_job.processed_by = None;
                    background_job.server_hostname = None;
                    background_job.started_at = None;
                    background_job.completed_at = None;
                    background_job.last_activity = None;
                    self.storage.save_background_job(&background_job).await?;
                    Ok(Some(background_job.id))
                }
                JobStatus::Processed | JobStatus::Failed => {
                    let attempt = BackgroundJob::enqueued(background_job.job_id);
                    self.storage.save_background_job(&attempt).await?;
                    Ok(Some(attempt.id))
                }
                JobStatus::Enqueued | JobStatus::Processing => Ok(Some(background_job.id)),
            };
        }

        let Some(long_term) = &self.long_term else {
            return Ok(None);
        };
        let Some(archived) = long_term.get_background_job(background_job_id).await? else {
            return Ok(None);
        };
        let Some(job) = long_term.get_job(archived.job_id).await? else {
            return Ok(None);
        };
        // Revive the definition in the hot store and run it afresh.
        self.storage.save_job(&job, true).await?;
        let attempt = BackgroundJob::enqueued(job.id);
        self.storage.save_background_job(&attempt).await?;
        debug!(job_id = %job.id, "archived job re-enqueued from cold store");
        Ok(Some(attempt.id))
    }

    /// Requests a stop. An Enqueued or Processing background job becomes
    /// Canceled and its monitor terminates it; anything else is a no-op.
    /// Returns whether a stop was actually requested.
    pub async fn stop(&self, background_job_id: Uuid) -> Result<bool> {
        let Some(mut background_job) =
            self.storage.get_background_job(background_job_id).await?
        else {
            return Ok(false);
        };
        if !background_job.status.is_in_flight() {
            return Ok(false);
        }
        background_job.status = JobStatus::Canceled;
        self.storage.save_background_job(&background_job).await?;
        info!(background_job_id = %background_job_id, "stop requested");
        Ok(true)
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.storage.delete_job(job_id).await
    }

    pub async fn delete_background_job(&self, background_job_id: Uuid) -> Result<()> {
        self.storage.delete_background_job(background_job_id).await
    }

    /// Wipes both stores (server registry excepted). Refused unless
    /// `enable_delete_all` is set in the configuration.
    pub async fn delete_all(&self) -> Result<()> {
        if !self.config.enable_delete_all {
            return Err(Error::Disabled("delete_all"));
        }
        self.storage.delete_all().await?;
        if let Some(long_term) = &self.long_term {
            long_term.delete_all().await?;
        }
        info!("all job data deleted");
        Ok(())
    }
}
