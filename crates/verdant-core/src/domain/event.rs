//! Lifecycle events emitted by broker adapters.

use serde::{Deserialize, Serialize};

use super::job_type::JobType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Active {
        job_type: JobType,
        job_id: String,
        attempt: u32,
    },
    Progress {
        job_type: JobType,
        job_id: String,
        progress: u8,
    },
    Completed {
        job_type: JobType,
        job_id: String,
    },
    /// Failed but will be attempted again.
    Retrying {
        job_type: JobType,
        job_id: String,
        attempt: u32,
        error: String,
    },
    Failed {
        job_type: JobType,
        job_id: String,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Active { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. } => job_id,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::Active { job_type, .. }
            | Self::Progress { job_type, .. }
            | Self::Completed { job_type, .. }
            | Self::Retrying { job_type, .. }
            | Self::Failed { job_type, .. } => *job_type,
        }
    }
}
