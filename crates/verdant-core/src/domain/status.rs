//! Query-time views: job status reports and queue statistics.

use serde::{Deserialize, Serialize};

use super::job::{Job, JobState};
use super::output::JobOutput;

/// Answer to a status query.
///
/// Superset of `JobState`: a query may also find nothing, or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
    NotFound,
    Error,
}

impl From<JobState> for JobStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Queued => Self::Queued,
            JobState::Active => Self::Active,
            JobState::Completed => Self::Completed,
            JobState::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub progress: u8,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusReport {
    pub fn not_found() -> Self {
        Self {
            status: JobStatus::NotFound,
            progress: 0,
            attempts_made: 0,
            result: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            progress: 0,
            attempts_made: 0,
            result: None,
            error: Some(message.into()),
        }
    }
}

impl From<Job> for JobStatusReport {
    fn from(job: Job) -> Self {
        Self {
            status: job.state.into(),
            progress: job.progress,
            attempts_made: job.attempts_made,
            result: job.result,
            error: job.error,
        }
    }
}

/// Per-queue bucket counts. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Which strategy is servicing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Durable broker with background workers.
    Broker,
    /// Synchronous in-process fallback.
    Inline,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Broker => "broker",
            Self::Inline => "inline",
        })
    }
}
