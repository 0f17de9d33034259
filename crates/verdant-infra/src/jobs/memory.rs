//! In-memory broker implementation.
//!
//! Process-local queue with the same bucket semantics as the Redis broker.
//! Used for single-process deployments and tests.
//! Note: Jobs are lost on process restart.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use verdant_core::domain::{Job, JobEvent, JobOutput, JobType, QueueStats};
use verdant_core::ports::{
    BrokerConnector, BrokerError, JobBroker, JobProcessor, ProcessorError, ProgressReporter,
};

use super::worker::drain_workers;
use crate::config::BrokerConfig;

const EVENT_BUFFER: usize = 256;

/// Stand-in deadline for delays too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn eligible_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Waiting order: highest priority first, then enqueue order.
type WaitingKey = (Reverse<i32>, u64);
type DelayedKey = (Instant, u64);

#[derive(Debug, Clone, Copy)]
enum Bucket {
    Waiting(WaitingKey),
    Delayed(DelayedKey),
    Active,
    Completed,
    Failed,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    location: HashMap<String, Bucket>,
    waiting: BTreeMap<WaitingKey, String>,
    delayed: BTreeMap<DelayedKey, String>,
    active: HashSet<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_waiting(&mut self, id: String, priority: i32) {
        let key = (Reverse(priority), self.next_seq());
        self.location.insert(id.clone(), Bucket::Waiting(key));
        self.waiting.insert(key, id);
    }

    fn push_delayed(&mut self, id: String, eligible_at: Instant) {
        let key = (eligible_at, self.next_seq());
        self.location.insert(id.clone(), Bucket::Delayed(key));
        self.delayed.insert(key, id);
    }

    /// Move every delayed job whose time has come into waiting.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            let priority = self
                .jobs
                .get(&id)
                .map(|job| job.options.priority)
                .unwrap_or_default();
            self.push_waiting(id, priority);
        }
    }

    fn next_delayed_at(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(at, _)| *at)
    }

    fn pop_waiting(&mut self) -> Option<String> {
        let (_, id) = self.waiting.pop_first()?;
        self.active.insert(id.clone());
        self.location.insert(id.clone(), Bucket::Active);
        Some(id)
    }

    fn push_completed(&mut self, id: String, max_retained: usize) {
        self.location.insert(id.clone(), Bucket::Completed);
        self.completed.push_back(id);
        while self.completed.len() > max_retained {
            if let Some(old_id) = self.completed.pop_front() {
                self.evict(&old_id);
            }
        }
    }

    fn push_failed(&mut self, id: String, max_retained: usize) {
        self.location.insert(id.clone(), Bucket::Failed);
        self.failed.push_back(id);
        while self.failed.len() > max_retained {
            if let Some(old_id) = self.failed.pop_front() {
                self.evict(&old_id);
            }
        }
    }

    fn evict(&mut self, id: &str) {
        self.jobs.remove(id);
        self.location.remove(id);
    }
}

struct Inner {
    job_type: JobType,
    config: BrokerConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<JobEvent>,
    running: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Claim the next eligible job, or report when to look again.
    async fn claim(&self) -> Result<Job, Option<Instant>> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());

        let Some(id) = state.pop_waiting() else {
            return Err(state.next_delayed_at());
        };

        let Some(job) = state.jobs.get_mut(&id) else {
            state.active.remove(&id);
            state.location.remove(&id);
            return Err(None);
        };
        job.activate();
        let job = job.clone();

        self.emit(JobEvent::Active {
            job_type: self.job_type,
            job_id: job.id.clone(),
            attempt: job.attempts_made,
        });
        Ok(job)
    }

    async fn finish(&self, job_id: &str, result: Result<JobOutput, ProcessorError>) {
        let mut state = self.state.lock().await;
        state.active.remove(job_id);

        let Some(job) = state.jobs.get_mut(job_id) else {
            state.location.remove(job_id);
            tracing::warn!(job_id = %job_id, "Finished job no longer tracked");
            return;
        };

        match result {
            Ok(output) => {
                job.complete(output);
                state.push_completed(job_id.to_string(), self.config.max_retained);
                tracing::debug!(job_id = %job_id, "Job completed successfully");
                self.emit(JobEvent::Completed {
                    job_type: self.job_type,
                    job_id: job_id.to_string(),
                });
            }
            Err(err) if err.is_retryable() && job.can_retry() => {
                let attempt = job.attempts_made;
                job.requeue(err.message());
                let delay = self.config.backoff_for(attempt);
                state.push_delayed(job_id.to_string(), eligible_after(delay));
                tracing::warn!(
                    job_id = %job_id,
                    attempt = attempt,
                    reason = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job failed, will retry"
                );
                self.emit(JobEvent::Retrying {
                    job_type: self.job_type,
                    job_id: job_id.to_string(),
                    attempt,
                    error: err.message().to_string(),
                });
                self.notify.notify_one();
            }
            Err(err) => {
                job.fail(err.message());
                state.push_failed(job_id.to_string(), self.config.max_retained);
                tracing::error!(job_id = %job_id, reason = %err, "Job failed");
                self.emit(JobEvent::Failed {
                    job_type: self.job_type,
                    job_id: job_id.to_string(),
                    error: err.message().to_string(),
                });
            }
        }
    }
}

/// Progress hook writing straight into the queue state.
struct MemoryProgress {
    inner: Arc<Inner>,
    job_id: String,
}

#[async_trait]
impl ProgressReporter for MemoryProgress {
    async fn report(&self, progress: u8) {
        let progress = progress.min(100);
        {
            let mut state = self.inner.state.lock().await;
            match state.jobs.get_mut(&self.job_id) {
                Some(job) => job.report_progress(progress),
                None => return,
            }
        }
        self.inner.emit(JobEvent::Progress {
            job_type: self.inner.job_type,
            job_id: self.job_id.clone(),
            progress,
        });
    }
}

/// In-memory broker for one job type.
pub struct InMemoryBroker {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InMemoryBroker {
    pub fn new(job_type: JobType, config: BrokerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            inner: Arc::new(Inner {
                job_type,
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                events,
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

async fn worker_loop(inner: Arc<Inner>, processor: Arc<dyn JobProcessor>, worker_id: usize) {
    tracing::info!(
        worker_id = worker_id,
        queue = %inner.job_type,
        "Job worker started"
    );

    while inner.running.load(Ordering::Acquire) {
        let job = match inner.claim().await {
            Ok(job) => job,
            Err(next_delayed) => {
                let mut wake_at = Instant::now() + inner.config.poll_interval;
                if let Some(at) = next_delayed {
                    wake_at = wake_at.min(at);
                }
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep_until(wake_at) => {}
                }
                continue;
            }
        };

        tracing::debug!(
            worker = worker_id,
            job_id = %job.id,
            job_type = %inner.job_type,
            attempt = job.attempts_made,
            "Processing job"
        );

        let reporter = MemoryProgress {
            inner: inner.clone(),
            job_id: job.id.clone(),
        };
        let result = AssertUnwindSafe(processor.process(&job, &reporter))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ProcessorError::retryable("processor panicked")));

        inner.finish(&job.id, result).await;
    }

    tracing::info!(worker_id = worker_id, queue = %inner.job_type, "Job worker shutting down");
}

#[async_trait]
impl JobBroker for InMemoryBroker {
    fn job_type(&self) -> JobType {
        self.inner.job_type
    }

    async fn add(&self, job: Job) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut state = self.inner.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            tracing::debug!(job_id = %job.id, "Job id already queued, ignoring duplicate");
            return Ok(());
        }

        let id = job.id.clone();
        let priority = job.options.priority;
        let delay_ms = job.options.delay_ms;
        state.jobs.insert(id.clone(), job);

        if delay_ms > 0 {
            state.push_delayed(id.clone(), eligible_after(Duration::from_millis(delay_ms)));
        } else {
            state.push_waiting(id.clone(), priority);
        }
        drop(state);

        self.inner.notify.notify_one();
        tracing::debug!(job_id = %id, job_type = %self.inner.job_type, "Job enqueued");
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, BrokerError> {
        let state = self.inner.state.lock().await;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn remove(&self, job_id: &str) -> Result<bool, BrokerError> {
        let mut state = self.inner.state.lock().await;
        let Some(bucket) = state.location.get(job_id).copied() else {
            return Ok(false);
        };

        match bucket {
            Bucket::Waiting(key) => {
                state.waiting.remove(&key);
            }
            Bucket::Delayed(key) => {
                state.delayed.remove(&key);
            }
            Bucket::Active => return Err(BrokerError::JobLocked(job_id.to_string())),
            Bucket::Completed | Bucket::Failed => return Ok(false),
        }

        state.location.remove(job_id);
        state.jobs.remove(job_id);
        tracing::debug!(job_id = %job_id, "Job removed");
        Ok(true)
    }

    async fn counts(&self) -> Result<QueueStats, BrokerError> {
        let state = self.inner.state.lock().await;
        Ok(QueueStats {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
        })
    }

    async fn start_workers(&self, processor: Arc<dyn JobProcessor>) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            tracing::warn!(queue = %self.inner.job_type, "Workers already running");
            return Ok(());
        }

        self.inner.running.store(true, Ordering::Release);
        for worker_id in 0..self.inner.config.workers_per_queue.max(1) {
            let inner = self.inner.clone();
            let processor = processor.clone();
            workers.push(tokio::spawn(worker_loop(inner, processor, worker_id)));
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.running.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        drain_workers(workers, self.inner.config.lease, self.inner.job_type.as_str()).await;
        tracing::info!(queue = %self.inner.job_type, "In-memory broker closed");
        Ok(())
    }
}

/// Connector handing out in-memory brokers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    config: BrokerConfig,
}

impl InMemoryConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self, job_type: JobType) -> Result<Arc<dyn JobBroker>, BrokerError> {
        Ok(Arc::new(InMemoryBroker::new(job_type, self.config.clone())))
    }
}
