use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for clients, servers and housekeeping.
///
/// This is an explicit value passed (behind an `Arc`) into every component
/// at construction; there is no process-wide configuration singleton.
/// Interval and timeout fields are plain seconds; accessor methods clamp
/// them into their supported ranges, so out-of-range values degrade to the
/// nearest bound instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Bounded retry budget for transient storage faults, per loop.
    #[serde(default = "default_connection_retries")]
    pub connection_retries: u32,
    /// Seconds between storage fault retries (2..=30).
    #[serde(default = "default_connection_retry_interval")]
    pub connection_retry_interval: u64,
    /// Seconds between job monitor heartbeats (1..=30).
    #[serde(default = "default_heartbeat_interval")]
    pub job_heartbeat_interval: u64,
    /// Seconds of silence after which a Processing job is considered dead.
    #[serde(default = "default_inactive_timeout")]
    pub inactive_job_timeout: u64,
    /// Seconds between server heartbeats (1..=30).
    #[serde(default = "default_heartbeat_interval")]
    pub server_heartbeat_interval: u64,
    /// Seconds of silence after which a server registration expires.
    #[serde(default = "default_inactive_timeout")]
    pub inactive_server_timeout: u64,
    /// Seconds between distributed lock heartbeats (1..=30).
    #[serde(default = "default_heartbeat_interval")]
    pub lock_heartbeat_interval: u64,
    /// Seconds of silence after which a lock ticket is evicted.
    #[serde(default = "default_inactive_timeout")]
    pub inactive_lock_timeout: u64,
    /// Days after which terminal background jobs are deleted (1..=730).
    #[serde(default = "default_storage_expiration_in_days")]
    pub storage_expiration_in_days: u32,
    /// Seconds between hot-to-cold migration runs (1..=30).
    #[serde(default = "default_storage_sync_interval")]
    pub storage_sync_interval: u64,
    /// Maximum background jobs migrated per batch (500..=10000).
    #[serde(default = "default_storage_sync_batch_size")]
    pub storage_sync_batch_size: usize,
    /// Seconds between storage cleaning runs (30..=1800).
    #[serde(default = "default_clean_storage_interval")]
    pub clean_storage_interval: u64,
    /// Allows `Servers::stop` to stop a server by id.
    #[serde(default = "default_true")]
    pub enable_stop_servers: bool,
    /// Allows `Client::delete_all` to wipe the stores.
    #[serde(default)]
    pub enable_delete_all: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            connection_retries: default_connection_retries(),
            connection_retry_interval: default_connection_retry_interval(),
            job_heartbeat_interval: default_heartbeat_interval(),
            inactive_job_timeout: default_inactive_timeout(),
            server_heartbeat_interval: default_heartbeat_interval(),
            inactive_server_timeout: default_inactive_timeout(),
            lock_heartbeat_interval: default_heartbeat_interval(),
            inactive_lock_timeout: default_inactive_timeout(),
            storage_expiration_in_days: default_storage_expiration_in_days(),
            storage_sync_interval: default_storage_sync_interval(),
            storage_sync_batch_size: default_storage_sync_batch_size(),
            clean_storage_interval: default_clean_storage_interval(),
            enable_stop_servers: true,
            enable_delete_all: false,
        }
    }
}

impl Configuration {
    pub fn connection_retries(&self) -> u32 {
        self.connection_retries.min(30)
    }

    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_secs(self.connection_retry_interval.clamp(2, 30))
    }

    pub fn job_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.job_heartbeat_interval.clamp(1, 30))
    }

    /// Inactivity timeouts must exceed their heartbeat interval by a few
    /// beats, otherwise healthy work would be reaped between refreshes.
    pub fn inactive_job_timeout(&self) -> Duration {
        let min = self.job_heartbeat_interval.clamp(1, 30) + 4;
        Duration::from_secs(self.inactive_job_timeout.clamp(min, 60.max(min)))
    }

    pub fn server_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.server_heartbeat_interval.clamp(1, 30))
    }

    pub fn inactive_server_timeout(&self) -> Duration {
        let min = self.server_heartbeat_interval.clamp(1, 30) + 4;
        Duration::from_secs(self.inactive_server_timeout.clamp(min, 60.max(min)))
    }

    pub fn lock_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lock_heartbeat_interval.clamp(1, 30))
    }

    pub fn inactive_lock_timeout(&self) -> Duration {
        let min = self.lock_heartbeat_interval.clamp(1, 30) + 4;
        Duration::from_secs(self.inactive_lock_timeout.clamp(min, 60.max(min)))
    }

    pub fn storage_expiration_in_days(&self) -> u32 {
        self.storage_expiration_in_days.clamp(1, 730)
    }

    pub fn storage_sync_interval(&self) -> Duration {
        Duration::from_secs(self.storage_sync_interval.clamp(1, 30))
    }

    pub fn storage_sync_batch_size(&self) -> usize {
        self.storage_sync_batch_size.clamp(500, 10_000)
    }

    pub fn clean_storage_interval(&self) -> Duration {
        Duration::from_secs(self.clean_storage_interval.clamp(30, 1800))
    }
}

/// Configuration of one worker-pool server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname recorded on the server registration and on every
    /// background job it processes.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Queues this server pulls from; defaults to a single "jobs" queue.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    /// Global cap on concurrently executing jobs across all queues.
    #[serde(default = "default_workers_count")]
    pub workers_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            queues: Vec::new(),
            workers_count: default_workers_count(),
        }
    }
}

/// Per-queue worker cap and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum concurrently executing jobs from this queue.
    #[serde(default = "default_queue_workers_count")]
    pub workers_count: usize,
    /// Automatic re-enqueues after a failure before giving up.
    #[serde(default)]
    pub retries: u32,
    /// Seconds to wait before a retry is promoted.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers_count: default_queue_workers_count(),
            retries: 0,
            retry_interval: default_retry_interval(),
        }
    }

    pub fn with_workers(mut self, count: usize) -> Self {
        self.workers_count = count;
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_interval: u64) -> Self {
        self.retries = retries;
        self.retry_interval = retry_interval;
        self
    }
}

const fn default_connection_retries() -> u32 {
    10
}

const fn default_connection_retry_interval() -> u64 {
    3
}

const fn default_heartbeat_interval() -> u64 {
    1
}

const fn default_inactive_timeout() -> u64 {
    15
}

const fn default_storage_expiration_in_days() -> u32 {
    30
}

const fn default_storage_sync_interval() -> u64 {
    1
}

const fn default_storage_sync_batch_size() -> usize {
    10_000
}

const fn default_clean_storage_interval() -> u64 {
    60
}

const fn default_workers_count() -> usize {
    50
}

const fn default_queue_workers_count() -> usize {
    10
}

const fn default_retry_interval() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}
