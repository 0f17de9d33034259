//! Data Transfer Objects - response bodies of the monitoring API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Status of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub job_type: String,
    /// `queued`, `active`, `completed`, `failed`, `not_found` or `error`.
    pub status: String,
    pub progress: u8,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bucket counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Counts for every job type, keyed by its wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    /// `broker` or `inline`.
    pub mode: String,
    pub queues: BTreeMap<String, QueueCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelJobResponse {
    pub job_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    /// Execution strategy currently servicing jobs.
    pub mode: String,
}
