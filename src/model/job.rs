use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::invocation::Invocation;
use crate::pattern::RecurringPattern;

/// How a job's invocation is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum JobKind {
    /// In-process, on a task spawned by the worker that claimed the job.
    Thread,
    /// As an external process launched with the serialized invocation.
    Microservice,
}

impl JobKind {
    /// Queue used when the invocation does not name one.
    pub const fn default_queue(self) -> &'static str {
        match self {
            Self::Thread => "jobs",
            Self::Microservice => "services",
        }
    }
}

/// A work definition: one-shot, scheduled, recurring, or dependent on
/// another background job's completion.
///
/// A `Job` describes *what* to run; each execution attempt is a separate
/// [`BackgroundJob`](super::BackgroundJob) referencing it by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Unique name, required for recurring jobs so a re-subscribe updates
    /// the existing entry instead of creating a duplicate.
    pub name: Option<String>,
    pub queue: String,
    pub kind: JobKind,
    pub invocation: Invocation,
    pub created_at: DateTime<Utc>,
    pub is_recurring: bool,
    /// One-shot promotion time; retries reuse this field for the backoff
    /// deadline.
    pub start_at: Option<DateTime<Utc>>,
    /// True while a pending schedule entry exists for this job; cleared
    /// the instant the job is promoted to a queue.
    pub active: bool,
    pub recurring_pattern: Option<RecurringPattern>,
    /// Attempt counter, incremented each time a background job starts.
    pub tries: u32,
    /// Comma-joined antecedent background job ids this job waits on.
    pub after_background_job_ids: Option<String>,
}

impl Job {
    pub fn new(invocation: Invocation, kind: JobKind) -> Self {
        let queue = invocation
            .queue
            .clone()
            .unwrap_or_else(|| kind.default_queue().to_string());
        Self {
            id: Uuid::new_v4(),
            name: None,
            queue,
            kind,
            invocation,
            created_at: Utc::now(),
            is_recurring: false,
            start_at: None,
            active: true,
            recurring_pattern: None,
            tries: 0,
            after_background_job_ids: None,
        }
    }

    pub fn with_start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_recurring_pattern(mut self, name: impl Into<String>, pattern: RecurringPattern) -> Self {
        self.name = Some(name.into());
        self.is_recurring = true;
        self.recurring_pattern = Some(pattern);
        self
    }

    pub fn with_antecedent(mut self, background_job_id: Uuid) -> Self {
        self.after_background_job_ids = Some(background_job_id.to_string());
        self
    }

    /// True when this job is waiting on a pending schedule entry, either
    /// a one-shot `start_at` or a recurring pattern.
    pub fn is_pending_schedule(&self) -> bool {
        self.is_recurring || self.start_at.is_some()
    }
}
