//! The worker-pool server: per-queue dequeue and promotion loops, the
//! server heartbeat, and storage housekeeping.
//!
//! Worker counters are process-local state under a mutex; correctness
//! across server processes comes solely from the per-entity distributed
//! lock on the storage side.

mod execution;
mod housekeeping;
mod scheduler;
mod worker;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Configuration, QueueConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::invocation::JobRegistry;
use crate::lock::DistributedLock;
use crate::model::{JobKind, Server, ServerStatus};
use crate::storage::{LongTermStorage, Storage};
use worker::Workers;

/// Shared state handed to every loop of one server instance.
pub(crate) struct ServerContext {
    pub config: Arc<Configuration>,
    pub storage: Arc<dyn Storage>,
    pub long_term: Option<Arc<dyn LongTermStorage>>,
    pub registry: Arc<JobRegistry>,
    pub server: Server,
    pub workers: Arc<Workers>,
    pub shutdown: CancellationToken,
}

/// One configured-but-not-yet-started worker-pool server.
pub struct ProcessingServer {
    config: Arc<Configuration>,
    storage: Arc<dyn Storage>,
    long_term: Option<Arc<dyn LongTermStorage>>,
    registry: Arc<JobRegistry>,
    server_config: ServerConfig,
}

impl ProcessingServer {
    pub fn new(
        config: Arc<Configuration>,
        storage: Arc<dyn Storage>,
        registry: Arc<JobRegistry>,
        server_config: ServerConfig,
    ) -> Self {
        Self {
            config,
            storage,
            long_term: None,
            registry,
            server_config,
        }
    }

    /// Attaches a cold store, enabling the hot-to-cold migration task.
    pub fn with_long_term(mut self, long_term: Arc<dyn LongTermStorage>) -> Self {
        self.long_term = Some(long_term);
        self
    }

    /// Registers the server and spawns all of its loops. The returned
    /// handle stops them.
    pub async fn start(self) -> Result<ServerHandle> {
        let queues = if self.server_config.queues.is_empty() {
            vec![
                QueueConfig::new(JobKind::Thread.default_queue()),
                QueueConfig::new(JobKind::Microservice.default_queue()),
            ]
        } else {
            self.server_config.queues.clone()
        };
        let hostname = self
            .server_config
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        let mut server = Server::new(hostname, queues.clone(), self.server_config.workers_count);
        server.has_data_sync = self.long_term.is_some();
        self.storage
            .save_server(&server, self.config.inactive_server_timeout())
            .await?;
        info!(server_id = %server.id, hostname = server.hostname, "server starting");

        let context = Arc::new(ServerContext {
            config: self.config,
            storage: self.storage,
            long_term: self.long_term,
            registry: self.registry,
            workers: Arc::new(Workers::new(server.workers_count)),
            server,
            shutdown: CancellationToken::new(),
        });

        let mut tasks = Vec::new();
        for queue in &queues {
            tasks.push(tokio::spawn(worker::dequeue_loop(
                context.clone(),
                queue.clone(),
            )));
            tasks.push(tokio::spawn(scheduler::promotion_loop(
                context.clone(),
                queue.name.clone(),
            )));
        }
        tasks.push(tokio::spawn(heartbeat_loop(context.clone())));
        tasks.extend(housekeeping::spawn(context.clone()));

        Ok(ServerHandle {
            id: context.server.id,
            context,
            tasks,
        })
    }
}

/// Controls one started server instance.
pub struct ServerHandle {
    id: Uuid,
    context: Arc<ServerContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Graceful local shutdown: interrupts every loop's sleep, waits for
    /// them, then marks the registration Stopped.
    pub async fn stop(self) -> Result<()> {
        self.context.shutdown.cancel();
        for task in self.tasks {
            if let Err(error) = task.await {
                if !error.is_cancelled() {
                    warn!(%error, "server task ended abnormally");
                }
            }
        }
        let mut server = self.context.server.clone();
        server.status = ServerStatus::Stopped;
        self.context
            .storage
            .save_server(&server, self.context.config.inactive_server_timeout())
            .await?;
        info!(server_id = %self.id, "server stopped");
        Ok(())
    }

    /// Runs until the server shuts down on its own (a remote
    /// [`Servers::stop`] observed by the heartbeat).
    pub async fn wait(self) -> Result<()> {
        self.context.shutdown.cancelled().await;
        self.stop().await
    }
}

/// Reconciles the registration every `server_heartbeat_interval` under the
/// server's own distributed lock; a persisted status other than Running
/// triggers shutdown of all loops.
async fn heartbeat_loop(context: Arc<ServerContext>) {
    let interval = context.config.server_heartbeat_interval();
    let ttl = context.config.inactive_server_timeout();
    let lock_key = context.server.id.to_string();
    let mut faults: u32 = 0;
    loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let guard = match DistributedLock::try_acquire(
            context.storage.clone(),
            &context.config,
            &lock_key,
            interval,
        )
        .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => continue,
            Err(error) => {
                faults += 1;
                warn!(%error, "server heartbeat lock failed");
                if faults > context.config.connection_retries() {
                    error!("server heartbeat giving up after repeated storage faults");
                    context.shutdown.cancel();
                    return;
                }
                continue;
            }
        };
        let synced = context
            .storage
            .sync_server(&context.server, ttl)
            .await;
        if let Err(error) = guard.release().await {
            warn!(%error, "failed to release server heartbeat lock");
        }
        match synced {
            Ok(server) if server.status != ServerStatus::Running => {
                info!(server_id = %server.id, "server stop observed, shutting down");
                context.shutdown.cancel();
                return;
            }
            Ok(_) => faults = 0,
            Err(error) => {
                faults += 1;
                warn!(%error, "server heartbeat sync failed");
                if faults > context.config.connection_retries() {
                    error!("server heartbeat giving up after repeated storage faults");
                    context.shutdown.cancel();
                    return;
                }
            }
        }
    }
}

/// Registry-wide server operations.
pub struct Servers;

impl Servers {
    pub async fn all(storage: &Arc<dyn Storage>) -> Result<Vec<Server>> {
        storage.servers().await
    }

    /// Requests a remote stop by flipping the persisted status under the
    /// server's lock; the target's heartbeat loop picks it up within one
    /// interval. Refused unless `enable_stop_servers` is set.
    pub async fn stop(
        storage: Arc<dyn Storage>,
        config: &Configuration,
        server_id: Uuid,
    ) -> Result<bool> {
        if !config.enable_stop_servers {
            return Err(Error::Disabled("stop_servers"));
        }
        let guard =
            DistributedLock::acquire(storage.clone(), config, &server_id.to_string()).await?;
        let result = async {
            let Some(mut server) = storage.get_server(server_id).await? else {
                return Ok(false);
            };
            server.status = ServerStatus::Stopped;
            storage
                .save_server(&server, config.inactive_server_timeout())
                .await?;
            info!(%server_id, "server stop requested");
            Ok(true)
        }
        .await;
        guard.release().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::error::JobError;
    use crate::invocation::{Invocation, JobContext, JobHandler};
    use crate::model::JobStatus;
    use crate::storage::MemoryStorage;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct PingArgs {
        payload: String,
    }

    struct Ping;

    impl JobHandler for Ping {
        type Arguments = PingArgs;

        fn name() -> &'static str {
            "ping"
        }

        async fn execute(
            _ctx: JobContext,
            arguments: Self::Arguments,
        ) -> std::result::Result<(), JobError> {
            if arguments.payload.is_empty() {
                return Err(JobError::new("empty payload"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_job_is_processed_end_to_end() {
        let config = Arc::new(Configuration::default());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut registry = JobRegistry::new();
        registry.register::<Ping>();

        let handle = ProcessingServer::new(
            config.clone(),
            storage.clone(),
            Arc::new(registry),
            ServerConfig::default(),
        )
        .start()
        .await
        .unwrap();

        let client = Client::new(config, storage.clone());
        let invocation = Invocation::builder("ping")
            .arg("payload", &"hello")
            .unwrap()
            .build()
            .unwrap();
        let background_job_id = client.enqueue(invocation, JobKind::Thread).await.unwrap();

        let mut status = JobStatus::Enqueued;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(record) = storage
                .get_background_job(background_job_id)
                .await
                .unwrap()
            {
                status = record.status;
                if status.is_terminal() {
                    break;
                }
            }
        }
        assert_eq!(status, JobStatus::Processed);

        handle.stop().await.unwrap();
        let registered = storage.servers().await.unwrap();
        assert_eq!(registered[0].status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_respects_the_configuration_flag() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = Configuration {
            enable_stop_servers: false,
            ..Configuration::default()
        };
        let result = Servers::stop(storage, &config, Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::Disabled("stop_servers"))));
    }

    #[tokio::test]
    async fn stop_flips_the_persisted_status() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = Configuration::default();
        let server = Server::new("worker-1", vec![], 50);
        storage
            .save_server(&server, config.inactive_server_timeout())
            .await
            .unwrap();

        assert!(Servers::stop(storage.clone(), &config, server.id)
            .await
            .unwrap());
        let persisted = storage.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_of_unknown_server_reports_false() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = Configuration::default();
        assert!(!Servers::stop(storage, &config, Uuid::new_v4())
            .await
            .unwrap());
    }
}
