//! Reference processors for each job type.
//!
//! Stand-ins for the rendering, calculation, extraction and export
//! services; the queue only sees them through `JobProcessor`.

mod export;
mod extraction;
mod lca;
mod pdf;

pub use export::ExportProcessor;
pub use extraction::ExtractionProcessor;
pub use lca::LcaProcessor;
pub use pdf::PdfProcessor;

use verdant_core::ProcessorRegistry;
use verdant_core::domain::JobType;

use crate::config::AppConfig;

/// Registry with a processor for every job type the worker can run.
///
/// A processor whose resources cannot be set up is left out; jobs of
/// that type are then rejected at submission.
pub fn registry(config: &AppConfig) -> ProcessorRegistry {
    let registry = ProcessorRegistry::new()
        .register(JobType::LcaCalculation, LcaProcessor)
        .register(JobType::ReportExport, ExportProcessor);

    let registry = match PdfProcessor::from_font_file(&config.pdf_font_path) {
        Ok(pdf) => registry.register(JobType::PdfGeneration, pdf),
        Err(e) => {
            tracing::error!(error = %e, "PDF font unavailable, pdf generation disabled");
            registry
        }
    };

    match ExtractionProcessor::new() {
        Ok(extraction) => registry.register(JobType::DataExtraction, extraction),
        Err(e) => {
            tracing::error!(error = %e, "HTTP client unavailable, data extraction disabled");
            registry
        }
    }
}
