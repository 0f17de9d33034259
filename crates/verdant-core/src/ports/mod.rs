//! Ports - trait definitions for external dependencies.
//! Brokers are implemented in infrastructure, processors by the
//! subsystems that own the actual work.

mod broker;
mod processor;

pub use broker::{BrokerConnector, BrokerError, JobBroker};
pub use processor::{JobProcessor, NoopProgress, ProcessorError, ProgressReporter};
