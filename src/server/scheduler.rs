//! Second-aligned promotion loop for scheduled and recurring jobs.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::error::Result;
use crate::model::Job;
use crate::server::ServerContext;

/// Once per wall-clock second, promotes every due job of one queue.
///
/// The due-job snapshot is only re-fetched when the store marks it
/// changed since this server last pulled it; promotion always re-reads
/// the individual job first, so a stale snapshot entry can not promote
/// twice.
pub(crate) async fn promotion_loop(context: Arc<ServerContext>, queue: String) {
    let client = Client::new(context.config.clone(), context.storage.clone());
    let mut snapshot: Vec<Job> = Vec::new();
    let mut faults: u32 = 0;
    debug!(queue, "promotion loop started");
    loop {
        let wait = until_next_second(Utc::now());
        tokio::select! {
            _ = context.shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        let tick = Utc::now();
        match promote_due(&context, &client, &queue, &mut snapshot, tick).await {
            Ok(()) => faults = 0,
            Err(storage_error) => {
                faults += 1;
                warn!(queue, error = %storage_error, "promotion cycle failed");
                if faults > context.config.connection_retries() {
                    error!(queue, "promotion loop giving up after repeated storage faults");
                    return;
                }
            }
        }
    }
}

fn until_next_second(now: DateTime<Utc>) -> Duration {
    let subsec = u64::from(now.timestamp_subsec_millis());
    Duration::from_millis(1000 - (subsec % 1000))
}

async fn promote_due(
    context: &Arc<ServerContext>,
    client: &Client,
    queue: &str,
    snapshot: &mut Vec<Job>,
    tick: DateTime<Utc>,
) -> Result<()> {
    let server_id = context.server.id;
    if context.storage.schedule_changed(server_id, queue).await? {
        *snapshot = context.storage.queue_schedule(server_id, queue).await?;
        debug!(queue, jobs = snapshot.len(), "schedule snapshot refreshed");
    }
    for job in snapshot.iter() {
        if !is_due(job, tick) {
            continue;
        }
        // Another server may have promoted it since the snapshot was
        // taken; trust only the live record.
        let Some(fresh) = context.storage.get_job(job.id).await? else {
            continue;
        };
        if !is_due(&fresh, tick) {
            continue;
        }
        if let Some(background_job_id) = client.enqueue_by_id(fresh.id).await? {
            info!(
                job_id = %fresh.id,
                background_job_id = %background_job_id,
                queue,
                "scheduled job promoted"
            );
        }
    }
    Ok(())
}

fn is_due(job: &Job, tick: DateTime<Utc>) -> bool {
    if job.is_recurring {
        job.recurring_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_matching(tick))
    } else {
        job.active && job.start_at.is_some_and(|at| at <= tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::invocation::{Invocation, JobRegistry};
    use crate::model::{JobKind, JobStatus, Server};
    use crate::pattern::RecurringPattern;
    use crate::server::worker::Workers;
    use crate::storage::{MemoryStorage, Storage};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tokio_util::sync::CancellationToken;

    fn context(storage: Arc<dyn Storage>) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            config: Arc::new(Configuration::default()),
            storage,
            long_term: None,
            registry: Arc::new(JobRegistry::new()),
            server: Server::new("test", vec![], 50),
            workers: Arc::new(Workers::new(50)),
            shutdown: CancellationToken::new(),
        })
    }

    fn client(context: &Arc<ServerContext>) -> Client {
        Client::new(context.config.clone(), context.storage.clone())
    }

    #[test]
    fn second_alignment_ignores_subsecond_drift() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
            + ChronoDuration::milliseconds(250);
        assert_eq!(until_next_second(now), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn due_one_shot_job_is_promoted_exactly_once() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let context = context(storage.clone());
        let client = client(&context);
        let job_id = client
            .schedule(
                Invocation::builder("work").build().unwrap(),
                JobKind::Thread,
                Utc::now() - ChronoDuration::seconds(1),
            )
            .await
            .unwrap();

        let mut snapshot = Vec::new();
        promote_due(&context, &client, "jobs", &mut snapshot, Utc::now())
            .await
            .unwrap();
        let attempt = storage
            .latest_background_job(job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, JobStatus::Enqueued);

        // A second cycle refreshes the snapshot and finds nothing due.
        promote_due(&context, &client, "jobs", &mut snapshot, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            storage.background_job_ids(job_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn future_one_shot_job_stays_pending() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let context = context(storage.clone());
        let client = client(&context);
        let job_id = client
            .schedule(
                Invocation::builder("work").build().unwrap(),
                JobKind::Thread,
                Utc::now() + ChronoDuration::hours(1),
            )
            .await
            .unwrap();

        let mut snapshot = Vec::new();
        promote_due(&context, &client, "jobs", &mut snapshot, Utc::now())
            .await
            .unwrap();
        assert_eq!(storage.latest_background_job(job_id).await.unwrap(), None);
        let job = storage.get_job(job_id).await.unwrap().unwrap();
        assert!(job.active);
    }

    #[tokio::test]
    async fn recurring_job_is_promoted_on_pattern_match() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let context = context(storage.clone());
        let client = client(&context);
        let pattern = RecurringPattern::new("0 * * * * *").unwrap();
        let job_id = client
            .subscribe(
                "minutely",
                Invocation::builder("work").build().unwrap(),
                JobKind::Thread,
                pattern,
            )
            .await
            .unwrap();

        let boundary = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let off_boundary = boundary + ChronoDuration::seconds(17);

        let mut snapshot = Vec::new();
        promote_due(&context, &client, "jobs", &mut snapshot, off_boundary)
            .await
            .unwrap();
        assert_eq!(storage.latest_background_job(job_id).await.unwrap(), None);

        promote_due(&context, &client, "jobs", &mut snapshot, boundary)
            .await
            .unwrap();
        assert!(storage
            .latest_background_job(job_id)
            .await
            .unwrap()
            .is_some());
    }
}
