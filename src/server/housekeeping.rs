//! Periodic storage maintenance: lock eviction and crash reaping,
//! expiry of old terminal jobs, and hot-to-cold migration.
//!
//! Each task runs under its own named distributed lock so at most one
//! server instance performs it at a time; failing to acquire the lock
//! just skips the cycle.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lock::DistributedLock;
use crate::model::JobStatus;
use crate::server::ServerContext;
use crate::storage::{ArchiveEntry, LongTermStorage};

const CLEAN_LOCK: &str = "CleanStorage";
const EXPIRE_LOCK: &str = "DeleteExpiredJobs";
const SYNC_LOCK: &str = "SyncJobs";

const EXPIRE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub(crate) fn spawn(context: Arc<ServerContext>) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![
        tokio::spawn(maintenance_loop(
            context.clone(),
            CLEAN_LOCK,
            context.config.clean_storage_interval(),
            |context| Box::pin(clean(context)),
        )),
        tokio::spawn(maintenance_loop(
            context.clone(),
            EXPIRE_LOCK,
            EXPIRE_INTERVAL,
            |context| Box::pin(expire(context)),
        )),
    ];
    if context.long_term.is_some() {
        tasks.push(tokio::spawn(maintenance_loop(
            context.clone(),
            SYNC_LOCK,
            context.config.storage_sync_interval(),
            |context| Box::pin(sync(context)),
        )));
    }
    tasks
}

type Task = fn(
    Arc<ServerContext>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

async fn maintenance_loop(
    context: Arc<ServerContext>,
    lock_key: &'static str,
    interval: Duration,
    task: Task,
) {
    debug!(task = lock_key, "housekeeping loop started");
    loop {
        // Jitter keeps a fleet of servers from contending in lockstep.
        let jitter = Duration::from_millis(fastrand::u64(0..500));
        tokio::select! {
            _ = context.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval + jitter) => {}
        }
        let guard = match DistributedLock::try_acquire(
            context.storage.clone(),
            &context.config,
            lock_key,
            Duration::ZERO,
        )
        .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => continue,
            Err(lock_error) => {
                warn!(task = lock_key, error = %lock_error, "housekeeping lock failed");
                continue;
            }
        };
        if let Err(task_error) = task(context.clone()).await {
            warn!(task = lock_key, error = %task_error, "housekeeping cycle failed");
        }
        if let Err(release_error) = guard.release().await {
            warn!(task = lock_key, error = %release_error, "failed to release housekeeping lock");
        }
    }
}

/// Evicts stale lock tickets and reaps Processing jobs whose heartbeat
/// went silent (crashed workers) by marking them Interrupted.
async fn clean(context: Arc<ServerContext>) -> Result<()> {
    let evicted = context
        .storage
        .evict_stale_locks(context.config.inactive_lock_timeout())
        .await?;
    if evicted > 0 {
        info!(evicted, "evicted stale lock tickets");
    }

    let horizon = Utc::now()
        - chrono::Duration::seconds(context.config.inactive_job_timeout().as_secs() as i64);
    let processing = context
        .storage
        .status_index(JobStatus::Processing, 0, usize::MAX)
        .await?;
    let mut reaped = 0;
    for background_job_id in processing {
        let Some(mut background_job) =
            context.storage.get_background_job(background_job_id).await?
        else {
            continue;
        };
        let last_seen = background_job
            .last_activity
            .or(background_job.started_at)
            .unwrap_or(background_job.created_at);
        if last_seen > horizon {
            continue;
        }
        background_job.status = JobStatus::Interrupted;
        background_job.completed_at = Some(Utc::now());
        context.storage.save_background_job(&background_job).await?;
        reaped += 1;
    }
    if reaped > 0 {
        info!(reaped, "reaped stalled processing jobs");
    }
    Ok(())
}

/// Deletes terminal jobs older than the retention window from whichever
/// store is authoritative.
async fn expire(context: Arc<ServerContext>) -> Result<()> {
    let cutoff = Utc::now()
        - chrono::Duration::days(i64::from(context.config.storage_expiration_in_days()));
    let deleted = match &context.long_term {
        Some(long_term) => long_term.delete_expired(cutoff).await?,
        None => context.storage.delete_expired(cutoff).await?,
    };
    if deleted > 0 {
        info!(deleted, %cutoff, "expired old terminal jobs");
    }
    Ok(())
}

/// Migrates Processed and Failed jobs (with their logs) to the cold
/// store, batch by batch, deleting each batch from the hot store after it
/// is safely written. Not globally atomic: a shutdown mid-migration
/// leaves already-migrated batches migrated and aborts the rest.
async fn sync(context: Arc<ServerContext>) -> Result<()> {
    let Some(long_term) = context.long_term.clone() else {
        return Ok(());
    };
    let entries = collect_terminal(&context).await?;
    if entries.is_empty() {
        return Ok(());
    }
    let batch_size = context.config.storage_sync_batch_size();
    let mut migrated = 0;
    for batch in entries.chunks(batch_size) {
        if context.shutdown.is_cancelled() {
            warn!(migrated, remaining = entries.len() - migrated, "migration aborted by shutdown");
            break;
        }
        migrate_batch(&context, &long_term, batch).await?;
        migrated += batch.len();
    }
    if migrated > 0 {
        debug!(migrated, "migrated terminal jobs to cold store");
    }
    Ok(())
}

async fn collect_terminal(context: &Arc<ServerContext>) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    for status in [JobStatus::Processed, JobStatus::Failed] {
        for background_job_id in context.storage.status_index(status, 0, usize::MAX).await? {
            let Some(background_job) =
                context.storage.get_background_job(background_job_id).await?
            else {
                continue;
            };
            let Some(job) = context.storage.get_job(background_job.job_id).await? else {
                continue;
            };
            let logs = context.storage.logs(background_job_id).await?;
            entries.push(ArchiveEntry {
                job,
                background_job,
                logs,
            });
        }
    }
    Ok(entries)
}

/// Write-cold-then-delete-hot, so a crash in between duplicates instead
/// of losing (the next cycle's upsert absorbs the duplicate).
async fn migrate_batch(
    context: &Arc<ServerContext>,
    long_term: &Arc<dyn LongTermStorage>,
    batch: &[ArchiveEntry],
) -> Result<()> {
    long_term.save_background_jobs(batch).await?;
    for entry in batch {
        context
            .storage
            .delete_background_job(entry.background_job.id)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::invocation::{Invocation, JobRegistry};
    use crate::model::{BackgroundJob, DistributedLockItem, Job, JobKind, JobLog, Server};
    use crate::server::worker::Workers;
    use crate::storage::{MemoryArchive, MemoryStorage, Storage};
    use chrono::Duration as ChronoDuration;
    use tokio_util::sync::CancellationToken;

    fn context(
        storage: Arc<dyn Storage>,
        long_term: Option<Arc<dyn LongTermStorage>>,
    ) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            config: Arc::new(Configuration::default()),
            storage,
            long_term,
            registry: Arc::new(JobRegistry::new()),
            server: Server::new("test", vec![], 50),
            workers: Arc::new(Workers::new(50)),
            shutdown: CancellationToken::new(),
        })
    }

    async fn processing_job(
        storage: &Arc<dyn Storage>,
        last_activity: chrono::DateTime<Utc>,
    ) -> BackgroundJob {
        let mut job = Job::new(
            Invocation::builder("work").build().unwrap(),
            JobKind::Thread,
        );
        job.active = false;
        storage.save_job(&job, false).await.unwrap();
        let mut background_job = BackgroundJob::enqueued(job.id);
        storage.save_background_job(&background_job).await.unwrap();
        background_job.status = JobStatus::Processing;
        background_job.last_activity = Some(last_activity);
        storage.save_background_job(&background_job).await.unwrap();
        background_job
    }

    #[tokio::test]
    async fn clean_reaps_stalled_processing_jobs_only() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let context = context(storage.clone(), None);
        let stalled =
            processing_job(&storage, Utc::now() - ChronoDuration::minutes(5)).await;
        let healthy = processing_job(&storage, Utc::now()).await;

        clean(context).await.unwrap();

        assert_eq!(
            storage
                .get_background_job(stalled.id)
                .await
                .unwrap()
                .unwrap()
                .status,
            JobStatus::Interrupted
        );
        assert_eq!(
            storage
                .get_background_job(healthy.id)
                .await
                .unwrap()
                .unwrap()
                .status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn clean_evicts_stale_lock_tickets() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let context = context(storage.clone(), None);
        let mut stale = DistributedLockItem::new("resource");
        stale.last_activity = Utc::now() - ChronoDuration::minutes(5);
        storage.save_distributed_lock(&stale).await.unwrap();

        clean(context).await.unwrap();

        assert!(storage.all_distributed_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_migrates_terminal_jobs_with_logs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let archive = Arc::new(MemoryArchive::new());
        let long_term: Arc<dyn LongTermStorage> = archive.clone();
        let context = context(storage.clone(), Some(long_term));

        let mut job = Job::new(
            Invocation::builder("work").build().unwrap(),
            JobKind::Thread,
        );
        job.active = false;
        storage.save_job(&job, false).await.unwrap();
        let mut background_job = BackgroundJob::enqueued(job.id);
        storage.save_background_job(&background_job).await.unwrap();
        storage
            .append_log(
                background_job.id,
                &JobLog {
                    time: Utc::now(),
                    cpu_usage: 1.5,
                    memory_usage: 20.0,
                    cpu_time: 0.25,
                },
            )
            .await
            .unwrap();
        background_job.complete();
        storage.save_background_job(&background_job).await.unwrap();

        sync(context).await.unwrap();

        // Gone from the hot store, present in the cold store with logs.
        assert_eq!(
            storage.get_background_job(background_job.id).await.unwrap(),
            None
        );
        assert_eq!(storage.get_job(job.id).await.unwrap(), None);
        let archived = archive
            .get_background_job(background_job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived.status, JobStatus::Processed);
        assert_eq!(archive.logs(background_job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expire_prefers_the_cold_store_when_configured() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let archive = Arc::new(MemoryArchive::new());
        let long_term: Arc<dyn LongTermStorage> = archive.clone();
        let context = context(storage.clone(), Some(long_term.clone()));

        let job = Job::new(
            Invocation::builder("work").build().unwrap(),
            JobKind::Thread,
        );
        let mut background_job = BackgroundJob::enqueued(job.id);
        background_job.complete();
        background_job.completed_at = Some(Utc::now() - ChronoDuration::days(45));
        long_term
            .save_background_jobs(&[ArchiveEntry {
                job,
                background_job: background_job.clone(),
                logs: Vec::new(),
            }])
            .await
            .unwrap();

        expire(context).await.unwrap();

        assert_eq!(
            archive.get_background_job(background_job.id).await.unwrap(),
            None
        );
    }
}
