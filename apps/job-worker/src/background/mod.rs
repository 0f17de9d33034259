//! Background tasks that run beside the job workers.

mod scheduler;

pub use scheduler::{Scheduler, SchedulerConfig, start_stats_heartbeat};
