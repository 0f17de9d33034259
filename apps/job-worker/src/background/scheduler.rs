//! Cron-style scheduler using tokio-cron-scheduler.
//!
//! Runs the periodic queue statistics heartbeat.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use verdant_infra::JobQueueService;

/// Every minute, on the minute.
const DEFAULT_STATS_CRON: &str = "0 * * * * *";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Enable scheduler.
    pub enabled: bool,
    /// Cron expression (seconds first) for the stats heartbeat.
    pub stats_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stats_cron: DEFAULT_STATS_CRON.to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("SCHEDULER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            stats_cron: std::env::var("STATS_LOG_CRON")
                .unwrap_or_else(|_| DEFAULT_STATS_CRON.to_string()),
        }
    }
}

/// Cron job scheduler wrapper.
pub struct Scheduler {
    inner: JobScheduler,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler.
    pub async fn new(config: SchedulerConfig) -> Result<Self, JobSchedulerError> {
        let inner = JobScheduler::new().await?;
        Ok(Self { inner, config })
    }

    /// Add a cron job.
    pub async fn add_cron<F, Fut>(
        &self,
        schedule: &str,
        task: F,
    ) -> Result<uuid::Uuid, JobSchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let job = Job::new_async(schedule, move |_uuid, _lock| {
            let task = task.clone();
            Box::pin(async move {
                task().await;
            })
        })?;

        let id = self.inner.add(job).await?;
        tracing::info!(schedule = %schedule, cron_id = %id, "Cron job registered");
        Ok(id)
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), JobSchedulerError> {
        if !self.config.enabled {
            tracing::info!("Scheduler disabled");
            return Ok(());
        }

        self.inner.start().await?;
        tracing::info!("Scheduler started");
        Ok(())
    }

    /// Stop the scheduler.
    pub async fn shutdown(&mut self) -> Result<(), JobSchedulerError> {
        self.inner.shutdown().await?;
        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

/// Log the bucket counts of every queue.
pub async fn log_queue_stats(jobs: &JobQueueService) {
    let mode = jobs.mode();
    for (job_type, stats) in jobs.get_queue_stats().await {
        tracing::info!(
            job_type = %job_type,
            mode = %mode,
            waiting = stats.waiting,
            active = stats.active,
            completed = stats.completed,
            failed = stats.failed,
            delayed = stats.delayed,
            "Queue stats"
        );
    }
}

/// Register and start the stats heartbeat. Returns `None` when disabled.
pub async fn start_stats_heartbeat(
    config: SchedulerConfig,
    jobs: Arc<JobQueueService>,
) -> Result<Option<Scheduler>, JobSchedulerError> {
    if !config.enabled {
        tracing::info!("Stats heartbeat disabled");
        return Ok(None);
    }

    let schedule = config.stats_cron.clone();
    let scheduler = Scheduler::new(config).await?;
    scheduler
        .add_cron(&schedule, move || {
            let jobs = jobs.clone();
            async move { log_queue_stats(&jobs).await }
        })
        .await?;
    scheduler.start().await?;

    Ok(Some(scheduler))
}
