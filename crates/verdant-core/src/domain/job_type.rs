//! Job types and their typed payloads.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of work the queue knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    PdfGeneration,
    LcaCalculation,
    DataExtraction,
    ReportExport,
}

impl JobType {
    /// Every job type, in a stable order.
    pub const ALL: [JobType; 4] = [
        JobType::PdfGeneration,
        JobType::LcaCalculation,
        JobType::DataExtraction,
        JobType::ReportExport,
    ];

    /// Queue name / wire tag for this job type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PdfGeneration => "pdf_generation",
            Self::LcaCalculation => "lca_calculation",
            Self::DataExtraction => "data_extraction",
            Self::ReportExport => "report_export",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known job type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job type: {0}")]
pub struct UnknownJobType(pub String);

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownJobType(s.to_string()))
    }
}

/// Report content handed to the PDF renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportData {
    pub id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfGenerationPayload {
    pub report_data: ReportData,
    #[serde(default = "default_pdf_format")]
    pub format: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_pdf_format() -> String {
    "A4".to_string()
}

/// Calculation switches. Unknown keys are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LcaOptions {
    #[serde(default)]
    pub include_transport: bool,
    #[serde(default)]
    pub include_processing: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LcaCalculationPayload {
    pub product_id: String,
    pub calculation_method: String,
    #[serde(default)]
    pub options: LcaOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataExtractionPayload {
    pub extraction_type: String,
    pub source_url: String,
    #[serde(default)]
    pub target_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportExportPayload {
    pub report_id: String,
    pub export_format: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Type-specific job data. The variant *is* the job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    PdfGeneration(PdfGenerationPayload),
    LcaCalculation(LcaCalculationPayload),
    DataExtraction(DataExtractionPayload),
    ReportExport(ReportExportPayload),
}

impl JobPayload {
    pub const fn job_type(&self) -> JobType {
        match self {
            Self::PdfGeneration(_) => JobType::PdfGeneration,
            Self::LcaCalculation(_) => JobType::LcaCalculation,
            Self::DataExtraction(_) => JobType::DataExtraction,
            Self::ReportExport(_) => JobType::ReportExport,
        }
    }
}
