//! Domain entities - jobs, payloads and their query-time views.

mod event;
mod job;
mod job_type;
mod output;
mod status;

pub use event::JobEvent;
pub use job::{DEFAULT_ATTEMPTS, Job, JobData, JobOptions, JobState, generate_job_id};
pub use job_type::{
    DataExtractionPayload, JobPayload, JobType, LcaCalculationPayload, LcaOptions,
    PdfGenerationPayload, ReportData, ReportExportPayload, UnknownJobType,
};
pub use output::JobOutput;
pub use status::{ExecutionMode, JobStatus, JobStatusReport, QueueStats};
