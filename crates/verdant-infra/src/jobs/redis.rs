//! Redis broker implementation.
//!
//! Layout per job type, under `{prefix}:{job_type}`:
//! - `:job:{id}`   job record (JSON string)
//! - `:waiting`    sorted set, score orders by priority then sequence
//! - `:delayed`    sorted set, score is the eligible-at unix millis
//! - `:active`     sorted set of claimed ids, score is the lease deadline
//! - `:completed`  sorted set, score is the finish unix millis
//! - `:failed`     sorted set, score is the finish unix millis
//! - `:priority`   hash id -> priority, used when promoting delayed jobs
//! - `:seq`        enqueue counter

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use verdant_core::domain::{Job, JobEvent, JobOutput, JobState, JobType, QueueStats};
use verdant_core::ports::{
    BrokerConnector, BrokerError, JobBroker, JobProcessor, ProcessorError, ProgressReporter,
};

use super::worker::drain_workers;
use crate::config::BrokerConfig;

const EVENT_BUFFER: usize = 256;

/// Keeps `-priority * 2^32 + seq` inside the exact range of a double.
const PRIORITY_LIMIT: i32 = 1 << 20;

const ADD_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[5], ARGV[1], ARGV[3])
local delay_until = tonumber(ARGV[4])
if delay_until > 0 then
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
else
  local seq = redis.call('INCR', KEYS[4])
  local score = -tonumber(ARGV[3]) * 4294967296 + seq
  redis.call('ZADD', KEYS[2], string.format('%.0f', score), ARGV[1])
end
return 1
";

const CLAIM_SCRIPT: &str = r"
local function enqueue(id)
  local priority = tonumber(redis.call('HGET', KEYS[5], id) or '0')
  local seq = redis.call('INCR', KEYS[4])
  redis.call('ZADD', KEYS[1], string.format('%.0f', -priority * 4294967296 + seq), id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  enqueue(id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  enqueue(id)
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[2], popped[1])
return popped[1]
";

const REMOVE_SCRIPT: &str = r"
local lease = redis.call('ZSCORE', KEYS[3], ARGV[1])
if lease and tonumber(lease) > tonumber(ARGV[2]) then
  return -1
end
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
  + redis.call('ZREM', KEYS[2], ARGV[1])
  + redis.call('ZREM', KEYS[3], ARGV[1])
if removed == 0 then
  return 0
end
redis.call('DEL', KEYS[4])
redis.call('HDEL', KEYS[5], ARGV[1])
return 1
";

const TRIM_SCRIPT: &str = r"
local excess = redis.call('ZCARD', KEYS[1]) - tonumber(ARGV[1])
if excess <= 0 then
  return 0
end
local ids = redis.call('ZRANGE', KEYS[1], 0, excess - 1)
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[2] .. id)
end
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, excess - 1)
return excess
";

fn command_err(e: RedisError) -> BrokerError {
    BrokerError::Command(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Key names for one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn new(prefix: &str, job_type: JobType) -> Self {
        Self {
            base: format!("{}:{}", prefix, job_type.as_str()),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.base, id)
    }

    fn bucket(&self, name: &str) -> String {
        format!("{}:{}", self.base, name)
    }
}

struct Scripts {
    add: Script,
    claim: Script,
    remove: Script,
    trim: Script,
}

struct Inner {
    job_type: JobType,
    conn: ConnectionManager,
    config: BrokerConfig,
    keys: QueueKeys,
    scripts: Scripts,
    events: broadcast::Sender<JobEvent>,
    running: AtomicBool,
}

impl Inner {
    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.job(job_id)).await.map_err(command_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(BrokerError::from))
            .transpose()
    }

    async fn store(&self, job: &Job) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        conn.set::<_, _, ()>(self.keys.job(&job.id), json)
            .await
            .map_err(command_err)
    }

    fn lease_deadline(&self, now: i64) -> i64 {
        now.saturating_add(millis(self.config.lease))
    }

    /// Push the lease of a job this worker is still processing.
    async fn extend_lease(&self, job_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.keys.bucket("active"))
            .arg("XX")
            .arg(self.lease_deadline(now_millis()))
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(())
    }

    /// Atomically recover expired leases, promote due delayed jobs and
    /// claim the next waiting one.
    async fn claim(&self) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.conn.clone();
        let now = now_millis();
        let claimed: Option<String> = self
            .scripts
            .claim
            .key(self.keys.bucket("waiting"))
            .key(self.keys.bucket("delayed"))
            .key(self.keys.bucket("active"))
            .key(self.keys.bucket("seq"))
            .key(self.keys.bucket("priority"))
            .arg(now)
            .arg(self.lease_deadline(now))
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;

        let Some(job_id) = claimed else {
            return Ok(None);
        };

        let Some(mut job) = self.load(&job_id).await? else {
            tracing::warn!(job_id = %job_id, "Claimed job has no record, dropping");
            conn.zrem::<_, _, ()>(self.keys.bucket("active"), &job_id)
                .await
                .map_err(command_err)?;
            return Ok(None);
        };

        // Still marked active: the previous claim expired without an outcome.
        if job.state == JobState::Active {
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempts_made,
                "Job lease expired, recovering"
            );
            if !job.can_retry() {
                self.finish(job, Err(ProcessorError::permanent("job lease expired")))
                    .await?;
                return Ok(None);
            }
        }

        job.activate();
        self.store(&job).await?;
        self.emit(JobEvent::Active {
            job_type: self.job_type,
            job_id: job.id.clone(),
            attempt: job.attempts_made,
        });
        Ok(Some(job))
    }

    async fn trim(&self, bucket: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let evicted: i64 = self
            .scripts
            .trim
            .key(self.keys.bucket(bucket))
            .arg(self.config.max_retained)
            .arg(self.keys.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;
        if evicted > 0 {
            tracing::debug!(bucket = bucket, evicted = evicted, "Trimmed retained jobs");
        }
        Ok(())
    }

    async fn finish(
        &self,
        mut job: Job,
        result: Result<JobOutput, ProcessorError>,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let active = self.keys.bucket("active");

        match result {
            Ok(output) => {
                job.complete(output);
                let json = serde_json::to_string(&job)?;
                let (): () = redis::pipe()
                    .atomic()
                    .set(self.keys.job(&job.id), json)
                    .ignore()
                    .zrem(&active, &job.id)
                    .ignore()
                    .zadd(self.keys.bucket("completed"), &job.id, now_millis())
                    .ignore()
                    .hdel(self.keys.bucket("priority"), &job.id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(command_err)?;
                tracing::debug!(job_id = %job.id, "Job completed successfully");
                self.emit(JobEvent::Completed {
                    job_type: self.job_type,
                    job_id: job.id.clone(),
                });
                self.trim("completed").await?;
            }
            Err(err) if err.is_retryable() && job.can_retry() => {
                let attempt = job.attempts_made;
                job.requeue(err.message());
                let delay = self.config.backoff_for(attempt);
                let eligible_at = now_millis().saturating_add(millis(delay));
                let json = serde_json::to_string(&job)?;
                let (): () = redis::pipe()
                    .atomic()
                    .set(self.keys.job(&job.id), json)
                    .ignore()
                    .zrem(&active, &job.id)
                    .ignore()
                    .zadd(self.keys.bucket("delayed"), &job.id, eligible_at)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(command_err)?;
                tracing::warn!(
                    job_id = %job.id,
                    attempt = attempt,
                    reason = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job queued for retry"
                );
                self.emit(JobEvent::Retrying {
                    job_type: self.job_type,
                    job_id: job.id.clone(),
                    attempt,
                    error: err.message().to_string(),
                });
            }
            Err(err) => {
                job.fail(err.message());
                let json = serde_json::to_string(&job)?;
                let (): () = redis::pipe()
                    .atomic()
                    .set(self.keys.job(&job.id), json)
                    .ignore()
                    .zrem(&active, &job.id)
                    .ignore()
                    .zadd(self.keys.bucket("failed"), &job.id, now_millis())
                    .ignore()
                    .hdel(self.keys.bucket("priority"), &job.id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(command_err)?;
                tracing::error!(job_id = %job.id, reason = %err, "Job failed");
                self.emit(JobEvent::Failed {
                    job_type: self.job_type,
                    job_id: job.id.clone(),
                    error: err.message().to_string(),
                });
                self.trim("failed").await?;
            }
        }

        Ok(())
    }
}

/// Progress hook persisting into the job record.
struct RedisProgress {
    inner: Arc<Inner>,
    job_id: String,
}

#[async_trait]
impl ProgressReporter for RedisProgress {
    async fn report(&self, progress: u8) {
        let progress = progress.min(100);
        let mut job = match self.inner.load(&self.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to load job for progress");
                return;
            }
        };

        job.report_progress(progress);
        if let Err(e) = self.inner.store(&job).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to store progress");
            return;
        }

        self.inner.emit(JobEvent::Progress {
            job_type: self.inner.job_type,
            job_id: self.job_id.clone(),
            progress,
        });
    }
}

/// Redis-backed broker for one job type.
pub struct RedisBroker {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisBroker {
    pub async fn new(job_type: JobType, config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = Client::open(config.redis.url.as_str())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        // Use timeout to prevent hanging if Redis is unreachable
        let conn_manager_fut = ConnectionManager::new(client);
        let conn = tokio::time::timeout(config.redis.connect_timeout, conn_manager_fut)
            .await
            .map_err(|_| BrokerError::Connection("Connection timed out".to_string()))?
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let keys = QueueKeys::new(&config.key_prefix, job_type);
        tracing::info!(
            url = %config.redis.url,
            queue = %keys.base,
            workers = config.workers_per_queue,
            "Connected to Redis broker"
        );

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            inner: Arc::new(Inner {
                job_type,
                conn,
                config,
                keys,
                scripts: Scripts {
                    add: Script::new(ADD_SCRIPT),
                    claim: Script::new(CLAIM_SCRIPT),
                    remove: Script::new(REMOVE_SCRIPT),
                    trim: Script::new(TRIM_SCRIPT),
                },
                events,
                running: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }
}

async fn worker_loop(inner: Arc<Inner>, processor: Arc<dyn JobProcessor>, worker_id: usize) {
    tracing::info!(
        worker_id = worker_id,
        queue = %inner.keys.base,
        "Job queue worker started"
    );

    while inner.running.load(Ordering::Acquire) {
        let job = match inner.claim().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(inner.config.poll_interval).await;
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Redis claim error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        tracing::debug!(
            worker_id = worker_id,
            job_id = %job.id,
            job_type = %inner.job_type,
            attempt = job.attempts_made,
            "Processing job"
        );

        let reporter = RedisProgress {
            inner: inner.clone(),
            job_id: job.id.clone(),
        };
        let result = {
            let refresh = inner.config.lease_refresh();
            let mut heartbeat =
                tokio::time::interval_at(tokio::time::Instant::now() + refresh, refresh);
            let work = AssertUnwindSafe(processor.process(&job, &reporter)).catch_unwind();
            tokio::pin!(work);

            loop {
                tokio::select! {
                    outcome = &mut work => {
                        break outcome.unwrap_or_else(|_| {
                            Err(ProcessorError::retryable("processor panicked"))
                        });
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = inner.extend_lease(&job.id).await {
                            tracing::warn!(job_id = %job.id, error = %e, "Failed to renew job lease");
                        }
                    }
                }
            }
        };

        // Reload so progress written during processing is kept.
        let latest = match inner.load(&job.id).await {
            Ok(Some(latest)) => latest,
            Ok(None) | Err(_) => job,
        };
        let job_id = latest.id.clone();
        if let Err(e) = inner.finish(latest, result).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }

    tracing::info!(worker_id = worker_id, "Worker stopping");
}

#[async_trait]
impl JobBroker for RedisBroker {
    fn job_type(&self) -> JobType {
        self.inner.job_type
    }

    async fn add(&self, job: Job) -> Result<(), BrokerError> {
        let mut conn = self.inner.conn.clone();
        let keys = &self.inner.keys;
        let job_json = serde_json::to_string(&job)?;
        let priority = job.options.priority.clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT);
        let delay_until = match job.options.delay_ms {
            0 => 0,
            delay => now_millis().saturating_add(i64::try_from(delay).unwrap_or(i64::MAX)),
        };

        let added: i64 = self
            .inner
            .scripts
            .add
            .key(keys.job(&job.id))
            .key(keys.bucket("waiting"))
            .key(keys.bucket("delayed"))
            .key(keys.bucket("seq"))
            .key(keys.bucket("priority"))
            .arg(&job.id)
            .arg(job_json)
            .arg(priority)
            .arg(delay_until)
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;

        if added == 0 {
            tracing::debug!(job_id = %job.id, "Job id already queued, ignoring duplicate");
        } else {
            tracing::debug!(job_id = %job.id, job_type = %self.inner.job_type, "Job enqueued");
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, BrokerError> {
        self.inner.load(job_id).await
    }

    async fn remove(&self, job_id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.inner.conn.clone();
        let keys = &self.inner.keys;
        let outcome: i64 = self
            .inner
            .scripts
            .remove
            .key(keys.bucket("waiting"))
            .key(keys.bucket("delayed"))
            .key(keys.bucket("active"))
            .key(keys.job(job_id))
            .key(keys.bucket("priority"))
            .arg(job_id)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;

        match outcome {
            -1 => Err(BrokerError::JobLocked(job_id.to_string())),
            0 => Ok(false),
            _ => {
                tracing::debug!(job_id = %job_id, "Job removed");
                Ok(true)
            }
        }
    }

    async fn counts(&self) -> Result<QueueStats, BrokerError> {
        let mut conn = self.inner.conn.clone();
        let keys = &self.inner.keys;
        let (waiting, active, completed, failed, delayed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(keys.bucket("waiting"))
                .zcard(keys.bucket("active"))
                .zcard(keys.bucket("completed"))
                .zcard(keys.bucket("failed"))
                .zcard(keys.bucket("delayed"))
                .query_async(&mut conn)
                .await
                .map_err(command_err)?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn start_workers(&self, processor: Arc<dyn JobProcessor>) -> Result<(), BrokerError> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            tracing::warn!(queue = %self.inner.keys.base, "Workers already running");
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
        self.inner.running.store(false, Ordering::Release);

        // Aborted jobs keep their lease and are recovered once it expires.
        let workers = std::mem::take(&mut *self.workers.lock().await);
        drain_workers(workers, self.inner.config.lease, &self.inner.keys.base).await;

        tracing::info!(queue = %self.inner.keys.base, "Redis broker closed");
        Ok(())
    }
}

/// Connector opening one Redis connection per job type.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: BrokerConfig,
}

impl RedisConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self, job_type: JobType) -> Result<Arc<dyn JobBroker>, BrokerError> {
        let broker = RedisBroker::new(job_type, self.config.clone()).await?;
        Ok(Arc::new(broker))
    }
}
