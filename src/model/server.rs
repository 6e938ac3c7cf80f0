use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::config::QueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ServerStatus {
    Running,
    Stopped,
}

/// A registered worker-pool server instance.
///
/// The record carries a time-to-live of the configured inactive-server
/// timeout in the hot store; a server that stops heartbeating simply
/// disappears from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub hostname: String,
    pub queues: Vec<QueueConfig>,
    pub status: ServerStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// True when the server migrates terminal jobs to a cold store.
    pub has_data_sync: bool,
    /// Global cap on concurrently executing jobs across all queues.
    pub workers_count: usize,
}

impl Server {
    pub fn new(hostname: impl Into<String>, queues: Vec<QueueConfig>, workers_count: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            hostname: hostname.into(),
            queues,
            status: ServerStatus::Running,
            started_at: now,
            last_activity: now,
            has_data_sync: false,
            workers_count,
        }
    }
}

/// One acquisition ticket in a distributed lock's per-key FIFO.
///
/// The ticket id is globally unique per acquisition attempt
/// (`"<uuid>:<key>"`); the ticket holds the lock iff it is the head of its
/// key's FIFO. `last_activity` is refreshed by the owner's heartbeat and
/// used to evict tickets of crashed owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLockItem {
    pub id: String,
    pub key: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl DistributedLockItem {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let now = Utc::now();
        Self {
            id: format!("{}:{key}", Uuid::new_v4()),
            key,
            started_at: now,
            last_activity: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_records_compare_including_queue_configuration() {
        let server = Server::new(
            "worker-1",
            vec![QueueConfig::new("jobs").with_retries(2, 60)],
            50,
        );
        assert_eq!(server, server.clone());

        let mut reconfigured = server.clone();
        reconfigured.queues[0].retries = 5;
        assert_ne!(server, reconfigured);
    }
}
