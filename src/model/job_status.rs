use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Execution state of a [`BackgroundJob`](super::BackgroundJob).
///
/// # State transitions
///
/// - `Enqueued` → `Processing` → `Processed` (success)
/// - `Enqueued` → `Processing` → `Failed` (execution error; may be
///   re-enqueued by the owning queue's retry policy)
/// - `Enqueued`/`Processing` → `Canceled` → `Interrupted` (stop requested)
/// - `Processing` → `Interrupted` (crashed worker detected by heartbeat)
///
/// `Processed`, `Failed` and `Interrupted` are terminal. `Canceled` is a
/// transient request-to-stop observed by the execution monitor, not a
/// resting state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
pub enum JobStatus {
    /// Waiting in its queue for a worker slot.
    Enqueued = 1,
    /// Claimed by a worker and currently executing.
    Processing = 2,
    /// Finished without an error.
    Processed = 3,
    /// Finished with an error (retry policy may re-enqueue the job).
    Failed = 4,
    /// A stop was requested; the monitor has not yet terminated the work.
    Canceled = 5,
    /// Terminated without completing: force-stopped or reaped after its
    /// heartbeat went silent.
    Interrupted = 6,
}

impl JobStatus {
    /// Numeric discriminant used as the status index key in storage.
    ///
    /// The values are part of the persisted format and stable across
    /// backends.
    pub fn index_key(self) -> String {
        (self as u8).to_string()
    }

    /// True for states that will never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Interrupted)
    }

    /// True while the job still occupies (or may claim) a worker slot.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Enqueued | Self::Processing)
    }
}
