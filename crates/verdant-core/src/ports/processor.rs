//! Processor port - the work behind each job type.
//!
//! Processors are supplied by the rendering, calculation, extraction and
//! export subsystems. The queue only needs a success/failure signal, an
//! optional stream of progress updates and a human-readable error message.

use async_trait::async_trait;

use crate::domain::{Job, JobOutput};

/// Progress hook handed to a running processor.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Record progress (0-100). Values above 100 are clamped.
    async fn report(&self, progress: u8);
}

/// Reporter that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

#[async_trait]
impl ProgressReporter for NoopProgress {
    async fn report(&self, _progress: u8) {}
}

/// Performs the work for one job type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Execute the job. Must be idempotent: delivery is at-least-once.
    async fn process(
        &self,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<JobOutput, ProcessorError>;
}

/// Processor failure. The message is suitable for end users.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// Transient; the broker retries while attempts remain.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help; the job fails immediately.
    #[error("{0}")]
    Permanent(String),
}

impl ProcessorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
