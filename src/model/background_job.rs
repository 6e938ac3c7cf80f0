use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JobStatus;
use crate::error::JobError;

/// One execution attempt of a [`Job`](super::Job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: Uuid,
    /// Weak reference to the owning job; the job record outlives every
    /// one of its background jobs.
    pub job_id: Uuid,
    /// Id of the server that claimed this attempt.
    pub processed_by: Option<Uuid>,
    pub server_hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monitor heartbeat; a Processing job whose heartbeat goes silent is
    /// reaped as Interrupted by housekeeping.
    pub last_activity: Option<DateTime<Utc>>,
}

impl BackgroundJob {
    pub fn enqueued(job_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            processed_by: None,
            server_hostname: None,
            created_at: Utc::now(),
            status: JobStatus::Enqueued,
            error: None,
            started_at: None,
            completed_at: None,
            last_activity: None,
        }
    }

    /// Finalizes the attempt: Failed when an error was captured,
    /// Processed otherwise.
    pub fn complete(&mut self) {
        self.status = if self.error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Processed
        };
        self.completed_at = Some(Utc::now());
    }
}

/// A resource-usage sample of an externally executing background job.
///
/// Samples are append-only and delta-compressed: the monitor only records
/// a sample when it differs from the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub time: DateTime<Utc>,
    /// Percent of total machine CPU, rounded to two decimals.
    pub cpu_usage: f64,
    /// Resident memory in megabytes, rounded to two decimals.
    pub memory_usage: f64,
    /// Accumulated processor seconds consumed so far, rounded to two
    /// decimals. Monotonic across the samples of one attempt.
    pub cpu_time: f64,
}

impl JobLog {
    /// Two samples are considered equal for delta compression when both
    /// usage figures match; the timestamp and the monotonic `cpu_time`
    /// are ignored.
    pub fn same_usage(&self, other: &JobLog) -> bool {
        self.cpu_usage == other.cpu_usage && self.memory_usage == other.memory_usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_classifies_by_captured_error() {
        let mut ok = BackgroundJob::enqueued(Uuid::new_v4());
        ok.complete();
        assert_eq!(ok.status, JobStatus::Processed);
        assert!(ok.completed_at.is_some());

        let mut failed = BackgroundJob::enqueued(Uuid::new_v4());
        failed.error = Some(JobError::new("boom"));
        failed.complete();
        assert_eq!(failed.status, JobStatus::Failed);
    }

    #[test]
    fn delta_compression_ignores_the_monotonic_fields() {
        let first = JobLog {
            time: Utc::now(),
            cpu_usage: 1.5,
            memory_usage: 20.0,
            cpu_time: 0.5,
        };
        let second = JobLog {
            cpu_time: 2.75,
            ..first.clone()
        };
        assert!(first.same_usage(&second));

        let changed = JobLog {
            memory_usage: 21.0,
            ..first.clone()
        };
        assert!(!first.same_usage(&changed));
    }
}
