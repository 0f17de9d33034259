//! # Verdant Core
//!
//! The domain layer of the Verdant job queue.
//! Job records, typed payloads and the ports that brokers and processors
//! implement. No infrastructure dependencies.

pub mod domain;
pub mod error;
pub mod ports;
pub mod registry;

pub use error::JobQueueError;
pub use registry::ProcessorRegistry;
