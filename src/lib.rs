//! taskmill - distributed background-job processing
//!
//! Clients enqueue, schedule, or chain units of work; one or more server
//! processes pull work from shared storage, execute it under a monitor,
//! and retry or expire it according to policy. Coordination across
//! processes relies on a heartbeat-based distributed ticket lock over the
//! shared store; in-process state is limited to worker admission counters.
//!
//! The building blocks:
//! - [`Client`](client::Client) — enqueue/schedule/subscribe/chain/stop.
//! - [`ProcessingServer`](server::ProcessingServer) — the worker pool.
//! - [`Storage`](storage::Storage) / [`LongTermStorage`](storage::LongTermStorage)
//!   — the hot/cold store contracts, with in-memory reference backends.
//! - [`JobRegistry`](invocation::JobRegistry) — maps invocation targets to
//!   in-process handlers.

pub mod client;
pub mod config;
pub mod error;
pub mod invocation;
pub mod lock;
pub mod model;
pub mod pattern;
pub mod server;
pub mod setup_tracing;
pub mod storage;

pub use client::Client;
pub use config::{Configuration, QueueConfig, ServerConfig};
pub use error::{Error, JobError, Result};
pub use invocation::{Invocation, JobContext, JobHandler, JobRegistry};
pub use model::{BackgroundJob, Job, JobKind, JobStatus, Server, ServerStatus};
pub use pattern::RecurringPattern;
pub use server::{ProcessingServer, ServerHandle, Servers};
pub use setup_tracing::setup_tracing;
