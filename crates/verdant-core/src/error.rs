//! Queue-level error types.

use thiserror::Error;

use crate::domain::JobType;
use crate::ports::BrokerError;

/// Errors surfaced by the job queue façade.
///
/// Broker outages never reach callers as errors; they switch the queue to
/// inline execution. What remains are problems with the submission itself.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("No processor registered for job type {0}")]
    NoProcessor(JobType),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
