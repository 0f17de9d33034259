//! Broker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            connect_timeout: Duration::from_secs(env_or("REDIS_CONNECT_TIMEOUT_SECS", 5)),
        }
    }
}

/// Which broker adapter to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Redis,
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(format!("unknown broker backend: {other}")),
        }
    }
}

/// Job queue configuration shared by every broker adapter.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub redis: RedisConfig,
    /// Key prefix; each job type gets `{prefix}:{job_type}`.
    pub key_prefix: String,
    /// Worker tasks per job type.
    pub workers_per_queue: usize,
    /// How long an idle worker waits before looking again.
    pub poll_interval: Duration,
    /// Base delay for exponential retry backoff.
    pub backoff_base: Duration,
    /// Completed and failed jobs kept per queue before eviction.
    pub max_retained: usize,
    /// How long a claim holds a job without a heartbeat before another
    /// worker may take it over. Also bounds how long `close` waits for
    /// busy workers.
    pub lease: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Redis,
            redis: RedisConfig::default(),
            key_prefix: "verdant".to_string(),
            workers_per_queue: 2,
            poll_interval: Duration::from_millis(500),
            backoff_base: Duration::from_millis(1000),
            max_retained: 1000,
            lease: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let backend = match std::env::var("JOB_BROKER") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Invalid JOB_BROKER, using redis");
                BrokerBackend::Redis
            }),
            Err(_) => BrokerBackend::Redis,
        };

        Self {
            backend,
            redis: RedisConfig::from_env(),
            key_prefix: std::env::var("JOB_QUEUE_PREFIX").unwrap_or_else(|_| "verdant".to_string()),
            workers_per_queue: env_or("JOB_QUEUE_WORKERS", 2),
            poll_interval: Duration::from_millis(env_or("JOB_QUEUE_POLL_INTERVAL_MS", 500)),
            backoff_base: Duration::from_millis(env_or("JOB_QUEUE_BACKOFF_MS", 1000)),
            max_retained: env_or("JOB_QUEUE_MAX_RETAINED", 1000),
            lease: Duration::from_millis(env_or("JOB_QUEUE_LEASE_MS", 30_000)),
        }
    }

    /// Retry delay after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }

    /// Interval at which a busy worker renews its lease.
    pub fn lease_refresh(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
