//! Persisted record types shared by all storage backends.
//!
//! Field names are stable across backends so hot-store records migrate to
//! the cold store without translation.

mod background_job;
mod job;
mod job_status;
mod server;

pub use background_job::{BackgroundJob, JobLog};
pub use job::{Job, JobKind};
pub use job_status::JobStatus;
pub use server::{DistributedLockItem, Server, ServerStatus};
