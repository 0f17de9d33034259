//! Report export - render a report reference as JSON or CSV.

use async_trait::async_trait;
use serde_json::{Value, json};
use verdant_core::domain::{Job, JobOutput, JobPayload, ReportExportPayload};
use verdant_core::ports::{JobProcessor, ProcessorError, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    fn parse(format: &str) -> Option<Self> {
        match format.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render(
    payload: &ReportExportPayload,
    format: ExportFormat,
    exported_at: &str,
) -> Result<Vec<u8>, ProcessorError> {
    match format {
        ExportFormat::Json => {
            let document = json!({
                "reportId": payload.report_id,
                "exportedAt": exported_at,
                "options": payload.options,
            });
            serde_json::to_vec_pretty(&document)
                .map_err(|e| ProcessorError::permanent(format!("Failed to encode export: {}", e)))
        }
        ExportFormat::Csv => {
            let mut out = String::from("field,value\n");
            out.push_str(&format!("report_id,{}\n", csv_field(&payload.report_id)));
            out.push_str(&format!("exported_at,{}\n", csv_field(exported_at)));
            if let Value::Object(options) = &payload.options {
                for (key, value) in options {
                    out.push_str(&format!("{},{}\n", csv_field(key), csv_field(&plain(value))));
                }
            }
            Ok(out.into_bytes())
        }
    }
}

pub struct ExportProcessor;

#[async_trait]
impl JobProcessor for ExportProcessor {
    async fn process(
        &self,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<JobOutput, ProcessorError> {
        let JobPayload::ReportExport(payload) = &job.payload else {
            return Err(ProcessorError::permanent("expected a report_export payload"));
        };

        let format = ExportFormat::parse(&payload.export_format).ok_or_else(|| {
            ProcessorError::permanent(format!(
                "Unsupported export format: {}",
                payload.export_format
            ))
        })?;
        progress.report(10).await;

        let exported_at = chrono::Utc::now().to_rfc3339();
        let data = render(payload, format, &exported_at)?;
        tracing::debug!(
            job_id = %job.id,
            report_id = %payload.report_id,
            format = ?format,
            bytes = data.len(),
            "Report exported"
        );
        progress.report(100).await;

        Ok(JobOutput::binary(format.content_type(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdant_core::domain::{JobData, JobOptions};
    use verdant_core::ports::NoopProgress;

    fn export_payload(format: &str, options: Value) -> ReportExportPayload {
        ReportExportPayload {
            report_id: "rep-7".to_string(),
            export_format: format.to_string(),
            options,
        }
    }

    #[test]
    fn test_csv_escapes_values() {
        let payload = export_payload("csv", json!({ "title": "Scope 1, 2 \"draft\"", "year": 2024 }));

        let csv = String::from_utf8(render(&payload, ExportFormat::Csv, "2024-01-01T00:00:00Z").unwrap())
            .unwrap();

        assert!(csv.starts_with("field,value\nreport_id,rep-7\n"));
        assert!(csv.contains("title,\"Scope 1, 2 \"\"draft\"\"\"\n"));
        assert!(csv.contains("year,2024\n"));
    }

    #[test]
    fn test_json_export() {
        let payload = export_payload("JSON", json!({ "lang": "en" }));

        let bytes = render(&payload, ExportFormat::Json, "2024-01-01T00:00:00Z").unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["reportId"], "rep-7");
        assert_eq!(value["options"]["lang"], "en");
    }

    #[tokio::test]
    async fn test_unsupported_format_is_permanent() {
        let job = Job::new(
            JobData::new(
                "user-1",
                JobPayload::ReportExport(export_payload("xlsx", Value::Null)),
            ),
            JobOptions::default(),
        );

        let err = ExportProcessor.process(&job, &NoopProgress).await.unwrap_err();

        assert!(!err.is_retryable());
        assert!(err.message().contains("xlsx"));
    }
}
