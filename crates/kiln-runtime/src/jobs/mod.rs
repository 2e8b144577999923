//! Background jobs submitted by plugins.
//!
//! A job is created `pending`, moves to `running` when its handler starts and
//! ends exactly once in `completed`, `failed` or `cancelled`. Callers only
//! ever see snapshots; the live record is owned by the [`JobManager`].

mod context;
mod export;
mod manager;

pub use context::{CancelToken, JobContext, JobHandler};
pub use export::{ExportFormat, JobExport};
pub use manager::{JobManager, JobManagerConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Event topics emitted for job lifecycle transitions.
pub mod topics {
    pub const STARTED: &str = "job.started";
    pub const PROGRESS: &str = "job.progress";
    pub const COMPLETED: &str = "job.completed";
    pub const FAILED: &str = "job.failed";
    pub const CANCELLED: &str = "job.cancelled";
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque 8-character id.
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    /// Percent complete, always within 0..=100.
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub plugin_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Job {
    pub(crate) fn new(
        id: String,
        name: &str,
        plugin_id: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            error_type: None,
            plugin_id: plugin_id.map(str::to_string),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Milliseconds between start and completion, when both are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

/// Failure reported by a job handler.
///
/// Any `std::error::Error` converts into it, so handlers can use `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub message: String,
    pub error_type: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for JobError
where
    E: std::error::Error,
{
    fn from(error: E) -> Self {
        Self {
            message: error.to_string(),
            error_type: Some(short_type_name::<E>().to_string()),
        }
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Aggregate counts over retained jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    fn count(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!(JobStatus::parse("done"), None);
    }

    #[test]
    fn test_duration_requires_both_timestamps() {
        let mut job = Job::new("abcd1234".into(), "scan", None, Map::new());
        assert_eq!(job.duration_ms(), None);

        let started = Utc::now();
        job.started_at = Some(started);
        job.completed_at = Some(started + Duration::milliseconds(250));
        assert_eq!(job.duration_ms(), Some(250));
    }

    #[test]
    fn test_job_error_from_std_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err: JobError = io.into();
        assert_eq!(err.message, "missing file");
        assert_eq!(err.error_type.as_deref(), Some("Error"));

        let parse: JobError = "x".parse::<i32>().unwrap_err().into();
        assert_eq!(parse.error_type.as_deref(), Some("ParseIntError"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, r#""cancelled""#);
    }
}
