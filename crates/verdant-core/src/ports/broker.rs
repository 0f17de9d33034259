//! Broker port - a persistent, priority-ordered queue per job type.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{Job, JobEvent, JobType, QueueStats};
use crate::ports::processor::JobProcessor;

/// One named queue backing a single job type.
///
/// Adapters own every state transition of the jobs they hold; callers
/// never mutate a stored `Job` directly.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// The job type this queue serves.
    fn job_type(&self) -> JobType;

    /// Enqueue a job honoring its priority, delay and attempts.
    async fn add(&self, job: Job) -> Result<(), BrokerError>;

    /// Look a job up in any bucket.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, BrokerError>;

    /// Remove a job that has not been claimed yet.
    ///
    /// Returns `Ok(false)` for unknown or finished jobs and
    /// `Err(BrokerError::JobLocked)` for jobs a worker is running.
    async fn remove(&self, job_id: &str) -> Result<bool, BrokerError>;

    /// Bucket counts.
    async fn counts(&self) -> Result<QueueStats, BrokerError>;

    /// Spawn workers that dispatch dequeued jobs to `processor`.
    async fn start_workers(&self, processor: Arc<dyn JobProcessor>) -> Result<(), BrokerError>;

    /// Lifecycle events, in transition order per job.
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;

    /// Stop workers and release the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Builds broker adapters. Construction is where an unreachable
/// backend surfaces.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, job_type: JobType) -> Result<Arc<dyn JobBroker>, BrokerError>;
}

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker command failed: {0}")]
    Command(String),

    #[error("Job serialization failed: {0}")]
    Serialization(String),

    #[error("Job {0} is being processed and cannot be removed")]
    JobLocked(String),

    #[error("Broker is closed")]
    Closed,
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
