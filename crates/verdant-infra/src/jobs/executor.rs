//! Execution strategies behind the job queue service.
//!
//! One strategy is selected at initialization and held for the lifetime
//! of the service: brokers with background workers, or inline execution
//! when no broker could be reached.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{RwLock, broadcast};

use verdant_core::domain::{ExecutionMode, Job, JobEvent, JobState, JobType, QueueStats};
use verdant_core::ports::{BrokerError, JobBroker, ProcessorError, ProgressReporter};
use verdant_core::{JobQueueError, ProcessorRegistry};

/// Inline runs kept for status queries.
const MAX_INLINE_RUNS: usize = 1000;

#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Hand a job over. Broker strategies return once enqueued, the inline
    /// strategy once the processor has finished.
    async fn submit(&self, job: Job) -> Result<(), JobQueueError>;

    async fn find(&self, job_type: JobType, job_id: &str) -> Result<Option<Job>, BrokerError>;

    async fn cancel(&self, job_type: JobType, job_id: &str) -> Result<bool, BrokerError>;

    async fn stats(&self, job_type: JobType) -> Result<QueueStats, BrokerError>;

    /// Lifecycle events for one job type, if this strategy emits any.
    fn subscribe(&self, job_type: JobType) -> Option<broadcast::Receiver<JobEvent>>;

    /// Release resources. Errors are logged, never returned.
    async fn shutdown(&self);
}

/// Dispatches every operation to the broker of the job's type.
pub struct BrokerBackedExecutor {
    brokers: HashMap<JobType, Arc<dyn JobBroker>>,
}

impl BrokerBackedExecutor {
    pub fn new(brokers: HashMap<JobType, Arc<dyn JobBroker>>) -> Self {
        Self { brokers }
    }

    fn broker(&self, job_type: JobType) -> Option<&Arc<dyn JobBroker>> {
        self.brokers.get(&job_type)
    }
}

#[async_trait]
impl JobExecutor for BrokerBackedExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Broker
    }

    async fn submit(&self, job: Job) -> Result<(), JobQueueError> {
        let job_type = job.job_type();
        let broker = self
            .broker(job_type)
            .ok_or(JobQueueError::NoProcessor(job_type))?;
        broker.add(job).await?;
        Ok(())
    }

    async fn find(&self, job_type: JobType, job_id: &str) -> Result<Option<Job>, BrokerError> {
        match self.broker(job_type) {
            Some(broker) => broker.get_job(job_id).await,
            None => Ok(None),
        }
    }

    async fn cancel(&self, job_type: JobType, job_id: &str) -> Result<bool, BrokerError> {
        let Some(broker) = self.broker(job_type) else {
            return Ok(false);
        };

        match broker.get_job(job_id).await? {
            Some(job) if !job.state.is_terminal() => broker.remove(job_id).await,
            _ => Ok(false),
        }
    }

    async fn stats(&self, job_type: JobType) -> Result<QueueStats, BrokerError> {
        match self.broker(job_type) {
            Some(broker) => broker.counts().await,
            None => Ok(QueueStats::default()),
        }
    }

    fn subscribe(&self, job_type: JobType) -> Option<broadcast::Receiver<JobEvent>> {
        self.broker(job_type).map(|broker| broker.subscribe())
    }

    async fn shutdown(&self) {
        // Each close drains its own workers; run them side by side.
        let closes = self
            .brokers
            .iter()
            .map(|(job_type, broker)| async move { (*job_type, broker.close().await) });

        for (job_type, result) in join_all(closes).await {
            match result {
                Ok(()) => tracing::debug!(job_type = %job_type, "Broker closed"),
                Err(e) => tracing::error!(job_type = %job_type, error = %e, "Failed to close broker"),
            }
        }
    }
}

#[derive(Default)]
struct InlineLedger {
    jobs: HashMap<(JobType, String), Job>,
    order: VecDeque<(JobType, String)>,
}

impl InlineLedger {
    fn insert(&mut self, job: Job) {
        let key = (job.job_type(), job.id.clone());
        if self.jobs.insert(key.clone(), job).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > MAX_INLINE_RUNS {
            if let Some(oldest) = self.order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }
}

/// Runs the processor in the caller's task, once, ignoring delay.
///
/// Finished runs are kept in a bounded ledger so status queries keep
/// working while no broker is available.
pub struct InlineExecutor {
    registry: ProcessorRegistry,
    ledger: RwLock<InlineLedger>,
}

impl InlineExecutor {
    pub fn new(registry: ProcessorRegistry) -> Self {
        Self {
            registry,
            ledger: RwLock::new(InlineLedger::default()),
        }
    }
}

struct InlineProgress<'a> {
    ledger: &'a RwLock<InlineLedger>,
    key: (JobType, String),
}

#[async_trait]
impl ProgressReporter for InlineProgress<'_> {
    async fn report(&self, progress: u8) {
        if let Some(job) = self.ledger.write().await.jobs.get_mut(&self.key) {
            job.report_progress(progress);
        }
    }
}

#[async_trait]
impl JobExecutor for InlineExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    async fn submit(&self, mut job: Job) -> Result<(), JobQueueError> {
        let job_type = job.job_type();
        let processor = self
            .registry
            .get(job_type)
            .ok_or(JobQueueError::NoProcessor(job_type))?;

        if job.options.delay_ms > 0 {
            tracing::debug!(job_id = %job.id, delay_ms = job.options.delay_ms, "Delay ignored in inline mode");
        }

        job.activate();
        let key = (job_type, job.id.clone());
        self.ledger.write().await.insert(job.clone());

        tracing::debug!(job_id = %job.id, job_type = %job_type, "Processing job inline");
        let reporter = InlineProgress {
            ledger: &self.ledger,
            key: key.clone(),
        };
        let result = AssertUnwindSafe(processor.process(&job, &reporter))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ProcessorError::retryable("processor panicked")));

        let mut ledger = self.ledger.write().await;
        let mut finished = ledger.jobs.get(&key).cloned().unwrap_or(job);
        match result {
            Ok(output) => {
                finished.complete(output);
                tracing::info!(job_id = %finished.id, job_type = %job_type, "Inline job completed");
            }
            Err(err) => {
                finished.fail(err.message());
                tracing::warn!(job_id = %finished.id, job_type = %job_type, reason = %err, "Inline job failed");
            }
        }
        ledger.insert(finished);

        Ok(())
    }

    async fn find(&self, job_type: JobType, job_id: &str) -> Result<Option<Job>, BrokerError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.jobs.get(&(job_type, job_id.to_string())).cloned())
    }

    async fn cancel(&self, _job_type: JobType, _job_id: &str) -> Result<bool, BrokerError> {
        // Inline runs finish before the caller gets the id back.
        Ok(false)
    }

    async fn stats(&self, job_type: JobType) -> Result<QueueStats, BrokerError> {
        let ledger = self.ledger.read().await;
        let mut stats = QueueStats::default();
        for job in ledger.jobs.values().filter(|job| job.job_type() == job_type) {
            match job.state {
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Queued => stats.waiting += 1,
            }
        }
        Ok(stats)
    }

    fn subscribe(&self, _job_type: JobType) -> Option<broadcast::Receiver<JobEvent>> {
        None
    }

    async fn shutdown(&self) {}
}
