//! Job queue - broker adapters, execution strategies and the service façade.

mod executor;
mod memory;
mod service;
mod worker;

pub use executor::{BrokerBackedExecutor, InlineExecutor, JobExecutor};
pub use memory::{InMemoryBroker, InMemoryConnector};
pub use service::JobQueueService;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::{RedisBroker, RedisConnector};
