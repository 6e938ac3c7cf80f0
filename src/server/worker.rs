//! Per-queue dequeue loop and process-local admission control.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::server::{execution, ServerContext};

/// Backoff for an empty queue starts here and multiplies by ten each
/// consecutive empty poll.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const BACKOFF_CEILING: Duration = Duration::from_millis(1000);
/// Sleep when admission control denies a slot.
const ADMISSION_RETRY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Counts {
    total: usize,
    per_queue: HashMap<String, usize>,
}

/// Process-local worker counters: a global cap for the server plus one
/// cap per queue. These only serialize admission within this process;
/// cross-process correctness comes from the distributed lock.
pub(crate) struct Workers {
    server_cap: usize,
    counts: Mutex<Counts>,
}

impl Workers {
    pub fn new(server_cap: usize) -> Self {
        Self {
            server_cap,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Claims a slot when both the server cap and the queue cap allow it.
    /// The slot is released when the returned guard drops.
    pub fn try_admit(self: &Arc<Self>, queue: &str, queue_cap: usize) -> Option<WorkerSlot> {
        let mut counts = self.lock();
        let queue_active = counts.per_queue.get(queue).copied().unwrap_or(0);
        if counts.total >= self.server_cap || queue_active >= queue_cap {
            return None;
        }
        counts.total += 1;
        *counts.per_queue.entry(queue.to_string()).or_default() += 1;
        Some(WorkerSlot {
            workers: self.clone(),
            queue: queue.to_string(),
        })
    }

    pub fn active(&self) -> usize {
        self.lock().total
    }

    fn release(&self, queue: &str) {
        let mut counts = self.lock();
        counts.total = counts.total.saturating_sub(1);
        if let Some(active) = counts.per_queue.get_mut(queue) {
            *active = active.saturating_sub(1);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One claimed worker slot; dropping it frees the slot.
pub(crate) struct WorkerSlot {
    workers: Arc<Workers>,
    queue: String,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.workers.release(&self.queue);
    }
}

/// Pulls work off one queue while slots are available, backing off
/// geometrically on empty polls.
pub(crate) async fn dequeue_loop(context: Arc<ServerContext>, queue: QueueConfig) {
    let mut backoff = INITIAL_BACKOFF;
    let mut faults: u32 = 0;
    debug!(queue = queue.name, "dequeue loop started");
    loop {
        if context.shutdown.is_cancelled() {
            return;
        }
        let Some(slot) = context.workers.try_admit(&queue.name, queue.workers_count) else {
            debug!(
                queue = queue.name,
                active = context.workers.active(),
                "worker slots exhausted, deferring dequeue"
            );
            tokio::select! {
                _ = context.shutdown.cancelled() => return,
                _ = tokio::time::sleep(ADMISSION_RETRY) => {}
            }
            continue;
        };
        match context.storage.dequeue(&queue.name).await {
            Ok(Some(background_job_id)) => {
                faults = 0;
                backoff = INITIAL_BACKOFF;
                let context = context.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    execution::process(context, queue, background_job_id, slot).await;
                });
            }
            Ok(None) => {
                drop(slot);
                faults = 0;
                tokio::select! {
                    _ = context.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 10).min(BACKOFF_CEILING);
            }
            Err(storage_error) => {
                drop(slot);
                faults += 1;
                warn!(queue = queue.name, error = %storage_error, "dequeue failed");
                if faults > context.config.connection_retries() {
                    error!(queue = queue.name, "dequeue loop giving up after repeated storage faults");
                    return;
                }
                tokio::select! {
                    _ = context.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(context.config.connection_retry_interval()) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_cap_limits_admission() {
        let workers = Arc::new(Workers::new(10));
        let first = workers.try_admit("jobs", 2);
        let second = workers.try_admit("jobs", 2);
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(workers.try_admit("jobs", 2).is_none());
        // A different queue still has room under the server cap.
        assert!(workers.try_admit("services", 2).is_some());
    }

    #[test]
    fn server_cap_limits_admission_across_queues() {
        let workers = Arc::new(Workers::new(2));
        let _a = workers.try_admit("a", 10).unwrap();
        let _b = workers.try_admit("b", 10).unwrap();
        assert!(workers.try_admit("c", 10).is_none());
        assert_eq!(workers.active(), 2);
    }

    #[test]
    fn dropping_a_slot_frees_it() {
        let workers = Arc::new(Workers::new(1));
        let slot = workers.try_admit("jobs", 1).unwrap();
        assert!(workers.try_admit("jobs", 1).is_none());
        drop(slot);
        let reacquired = workers.try_admit("jobs", 1);
        assert!(reacquired.is_some());
        assert_eq!(workers.active(), 1);
    }
}
