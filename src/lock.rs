//! Cross-process ticket lock over the hot store.
//!
//! Each acquisition appends a uniquely-identified ticket to the key's FIFO
//! and heartbeats it; the ticket holds the lock iff it is the head of the
//! FIFO. Stale heads (crashed owners) are evicted during the head check
//! and by storage housekeeping.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::model::DistributedLockItem;
use crate::storage::Storage;

pub struct DistributedLock;

impl DistributedLock {
    /// Acquires the lock on `key`, waiting as long as it takes.
    pub async fn acquire(
        storage: Arc<dyn Storage>,
        config: &Configuration,
        key: &str,
    ) -> Result<LockGuard> {
        match Self::wait(storage, config, key, None).await? {
            Some(guard) => Ok(guard),
            // Unreachable without a deadline, but the type does not know.
            None => Err(Error::LockTimeout(key.to_string())),
        }
    }

    /// Bounded acquisition. A zero timeout checks the head exactly once.
    /// Contention is an expected outcome, so it is `Ok(None)`, not an
    /// error.
    pub async fn try_acquire(
        storage: Arc<dyn Storage>,
        config: &Configuration,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>> {
        Self::wait(storage, config, key, Some(timeout)).await
    }

    async fn wait(
        storage: Arc<dyn Storage>,
        config: &Configuration,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<LockGuard>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ticket = DistributedLockItem::new(key);
        storage.save_distributed_lock(&ticket).await?;

        let heartbeat = CancellationToken::new();
        tokio::spawn(heartbeat_loop(
            storage.clone(),
            ticket.clone(),
            config.lock_heartbeat_interval(),
            heartbeat.clone(),
        ));

        let inactive_timeout = config.inactive_lock_timeout();
        let poll_interval = config.lock_heartbeat_interval();
        let outcome: Result<bool> = async {
            loop {
                if storage
                    .is_distributed_lock_entered(key, &ticket.id, inactive_timeout)
                    .await?
                {
                    return Ok(true);
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Ok(false);
                }
                // Keep our own ticket fresh even if the heartbeat task lags.
                ticket.last_activity = Utc::now();
                storage.save_distributed_lock(&ticket).await?;
                let jitter = Duration::from_millis(fastrand::u64(0..50));
                tokio::time::sleep(poll_interval + jitter).await;
            }
        }
        .await;

        match outcome {
            Ok(true) => {
                debug!(key, ticket = %ticket.id, "distributed lock acquired");
                Ok(Some(LockGuard {
                    storage,
                    ticket_id: Some(ticket.id),
                    key: key.to_string(),
                    heartbeat,
                }))
            }
            Ok(false) => {
                heartbeat.cancel();
                storage.delete_distributed_lock(&ticket.id).await?;
                debug!(key, "distributed lock wait timed out");
                Ok(None)
            }
            Err(error) => {
                // The ticket must not outlive a failed attempt: an
                // orphaned heartbeat would keep it fresh in the key's FIFO
                // and block every later caller.
                heartbeat.cancel();
                if let Err(delete_error) = storage.delete_distributed_lock(&ticket.id).await {
                    warn!(
                        key,
                        error = %delete_error,
                        "failed to delete the ticket of a failed lock attempt"
                    );
                }
                Err(error)
            }
        }
    }
}

async fn heartbeat_loop(
    storage: Arc<dyn Storage>,
    mut ticket: DistributedLockItem,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        ticket.last_activity = Utc::now();
        if let Err(error) = storage.save_distributed_lock(&ticket).await {
            warn!(key = ticket.key, %error, "distributed lock heartbeat failed");
        }
    }
}

/// Holds a distributed lock until released or dropped.
///
/// Dropping the guard stops the heartbeat and deletes the ticket on a
/// best-effort background task; prefer [`release`](LockGuard::release)
/// where the caller can await the removal.
pub struct LockGuard {
    storage: Arc<dyn Storage>,
    ticket_id: Option<String>,
    key: String,
    heartbeat: CancellationToken,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<()> {
        self.heartbeat.cancel();
        if let Some(ticket_id) = self.ticket_id.take() {
            self.storage.delete_distributed_lock(&ticket_id).await?;
            debug!(key = self.key, "distributed lock released");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        let Some(ticket_id) = self.ticket_id.take() else {
            return;
        };
        let storage = self.storage.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = storage.delete_distributed_lock(&ticket_id).await {
                    warn!(%error, "failed to release dropped distributed lock");
                }
            });
        }
    }
}
