use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("invalid recurring pattern: {0}")]
    InvalidPattern(String),

    #[error("timed out acquiring distributed lock for key '{0}'")]
    LockTimeout(String),

    #[error("operation is disabled by configuration: {0}")]
    Disabled(&'static str),

    #[error("failed to launch process '{0}': {1}")]
    ProcessLaunch(String, std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A structured execution failure persisted on a background job.
///
/// Captures the failure message, an optional trace, and a chained inner
/// cause. For external processes the error is reconstructed from the
/// captured standard-error stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<JobError>>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
            inner: None,
        }
    }

    pub fn with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Some(trace.into()),
            inner: None,
        }
    }

    pub fn with_inner(mut self, inner: JobError) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Builds a job error from the captured standard-error output of an
    /// external process. The first line becomes the message (with the
    /// common runtime banner stripped), the remainder the trace.
    pub fn from_stderr(stderr: &str) -> Self {
        let mut lines = stderr.lines();
        let mut message = lines.next().unwrap_or("Unknown error").to_string();
        if let Some(stripped) = message.strip_prefix("Unhandled exception. ") {
            message = stripped.to_string();
        }
        let trace = lines.collect::<Vec<_>>().join("\n");
        let trace = trace.trim().to_string();
        Self {
            message,
            trace: if trace.is_empty() { None } else { Some(trace) },
            inner: None,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, ": {inner}")?;
        }
        Ok(())
    }
}
