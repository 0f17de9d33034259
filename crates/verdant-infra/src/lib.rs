//! # Verdant Infrastructure
//!
//! Broker adapters for the ports defined in `verdant-core`, plus the
//! job queue service that selects between them.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All features enabled
//! - `minimal` - No external dependencies, in-memory broker only
//! - `redis` - Redis-backed job broker

pub mod config;
pub mod jobs;

use std::sync::Arc;

use verdant_core::ports::BrokerConnector;

pub use config::{BrokerBackend, BrokerConfig, RedisConfig};
pub use jobs::{InMemoryBroker, InMemoryConnector, JobQueueService};

#[cfg(feature = "redis")]
pub use jobs::{RedisBroker, RedisConnector};

/// Build the connector selected by `config.backend`.
pub fn connector_from_config(config: &BrokerConfig) -> Arc<dyn BrokerConnector> {
    match config.backend {
        #[cfg(feature = "redis")]
        BrokerBackend::Redis => Arc::new(RedisConnector::new(config.clone())),
        #[cfg(not(feature = "redis"))]
        BrokerBackend::Redis => {
            tracing::warn!("Built without redis feature - using in-memory broker");
            Arc::new(InMemoryConnector::new(config.clone()))
        }
        BrokerBackend::Memory => Arc::new(InMemoryConnector::new(config.clone())),
    }
}
