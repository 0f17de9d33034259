//! Application state - shared across all handlers.

use std::sync::Arc;

use verdant_infra::{JobQueueService, connector_from_config};

use crate::config::AppConfig;
use crate::processors;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobQueueService>,
}

impl AppState {
    /// Build the job queue and connect its brokers.
    ///
    /// Never fails: an unreachable broker leaves the queue running inline.
    pub async fn new(config: &AppConfig) -> Self {
        let registry = processors::registry(config);
        let connector = connector_from_config(&config.broker);
        let jobs = Arc::new(JobQueueService::new(registry, connector));

        let mode = jobs.initialize().await;
        tracing::info!(
            mode = %mode,
            backend = ?config.broker.backend,
            "Application state initialized"
        );

        Self { jobs }
    }
}
