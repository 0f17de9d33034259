//! Processor registry - which processor runs which job type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::JobType;
use crate::ports::JobProcessor;

/// Maps each job type to the processor supplied by its owning subsystem.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the processor for a job type.
    pub fn register<P: JobProcessor + 'static>(mut self, job_type: JobType, processor: P) -> Self {
        self.processors.insert(job_type, Arc::new(processor));
        self
    }

    /// Register an already shared processor.
    pub fn register_shared(mut self, job_type: JobType, processor: Arc<dyn JobProcessor>) -> Self {
        self.processors.insert(job_type, processor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.processors.contains_key(&job_type)
    }

    /// Registered job types in stable order.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.processors.keys().copied().collect();
        types.sort();
        types
    }
}
