//! PDF rendering - report title and body laid out with genpdf.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use genpdf::{Document, Element, PaperSize, SimplePageDecorator, elements, fonts, style};
use verdant_core::domain::{Job, JobOutput, JobPayload, ReportData};
use verdant_core::ports::{JobProcessor, ProcessorError, ProgressReporter};

const MARGIN_MM: i32 = 20;
const TITLE_SIZE: u8 = 18;
const BODY_SIZE: u8 = 11;

#[derive(Debug, thiserror::Error)]
pub enum FontError {
    #[error("failed to read font {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid font {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: genpdf::error::Error,
    },
}

fn paper_size(format: &str) -> Option<PaperSize> {
    match format.to_ascii_lowercase().as_str() {
        "a4" => Some(PaperSize::A4),
        "letter" => Some(PaperSize::Letter),
        "legal" => Some(PaperSize::Legal),
        _ => None,
    }
}

pub struct PdfProcessor {
    fonts: fonts::FontFamily<fonts::FontData>,
}

impl PdfProcessor {
    /// Load the TrueType font used for every style.
    pub fn from_font_file(path: &Path) -> Result<Self, FontError> {
        let data = std::fs::read(path).map_err(|source| FontError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let font = fonts::FontData::new(data, None).map_err(|source| FontError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            fonts: fonts::FontFamily {
                regular: font.clone(),
                bold: font.clone(),
                italic: font.clone(),
                bold_italic: font,
            },
        })
    }
}

fn render(
    fonts: fonts::FontFamily<fonts::FontData>,
    report: &ReportData,
    paper: PaperSize,
) -> Result<Vec<u8>, genpdf::error::Error> {
    let mut doc = Document::new(fonts);
    doc.set_title(report.title.clone());
    doc.set_paper_size(paper);
    doc.set_font_size(BODY_SIZE);

    let mut decorator = SimplePageDecorator::new();
    decorator.set_margins(MARGIN_MM);
    doc.set_page_decorator(decorator);

    doc.push(
        elements::Paragraph::new(report.title.clone())
            .styled(style::Style::new().bold().with_font_size(TITLE_SIZE)),
    );
    doc.push(elements::Break::new(1));
    for line in report.content.lines() {
        if line.trim().is_empty() {
            doc.push(elements::Break::new(1));
        } else {
            doc.push(elements::Paragraph::new(line.to_string()));
        }
    }

    let mut out = Vec::new();
    doc.render(&mut out)?;
    Ok(out)
}

#[async_trait]
impl JobProcessor for PdfProcessor {
    async fn process(
        &self,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<JobOutput, ProcessorError> {
        let JobPayload::PdfGeneration(payload) = &job.payload else {
            return Err(ProcessorError::permanent("expected a pdf_generation payload"));
        };

        let paper = paper_size(&payload.format).ok_or_else(|| {
            ProcessorError::permanent(format!("Unsupported page format: {}", payload.format))
        })?;
        progress.report(10).await;

        let fonts = self.fonts.clone();
        let report = payload.report_data.clone();
        let document = tokio::task::spawn_blocking(move || render(fonts, &report, paper))
            .await
            .map_err(|e| ProcessorError::retryable(format!("PDF render task failed: {}", e)))?
            .map_err(|e| ProcessorError::permanent(format!("Failed to render PDF: {}", e)))?;

        tracing::debug!(
            job_id = %job.id,
            report_id = %payload.report_data.id,
            bytes = document.len(),
            "PDF rendered"
        );
        progress.report(100).await;

        Ok(JobOutput::binary("application/pdf", document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdant_core::domain::{JobData, JobOptions, PdfGenerationPayload};
    use verdant_core::ports::NoopProgress;

    /// Skips when no font is installed.
    fn test_processor() -> Option<PdfProcessor> {
        let path = std::env::var("PDF_FONT_PATH")
            .unwrap_or_else(|_| "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string());
        PdfProcessor::from_font_file(Path::new(&path)).ok()
    }

    fn pdf_job(format: &str, content: &str) -> Job {
        Job::new(
            JobData::new(
                "user-1",
                JobPayload::PdfGeneration(PdfGenerationPayload {
                    report_data: ReportData {
                        id: "rep-1".to_string(),
                        title: "Footprint (2024)".to_string(),
                        content: content.to_string(),
                    },
                    format: format.to_string(),
                    options: serde_json::Value::Null,
                }),
            ),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_renders_pdf_document() {
        let Some(processor) = test_processor() else {
            return;
        };

        let output = processor
            .process(&pdf_job("A4", "Scope 1: 120 t\n\nScope 2: 80 t"), &NoopProgress)
            .await
            .unwrap();

        let JobOutput::Binary { content_type, data } = output else {
            panic!("expected binary output");
        };
        assert_eq!(content_type, "application/pdf");
        assert!(data.starts_with(b"%PDF-"));
        assert!(String::from_utf8_lossy(&data).trim_end().ends_with("%%EOF"));
    }

    #[tokio::test]
    async fn test_long_report_renders() {
        let Some(processor) = test_processor() else {
            return;
        };
        let content = "Emission factor review for the reporting period.\n".repeat(200);

        let output = processor
            .process(&pdf_job("legal", &content), &NoopProgress)
            .await
            .unwrap();

        assert!(output.as_bytes().unwrap().starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn test_unknown_format_is_permanent() {
        let Some(processor) = test_processor() else {
            return;
        };

        let err = processor
            .process(&pdf_job("tabloid", "x"), &NoopProgress)
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
    }

    #[test]
    fn test_paper_sizes() {
        assert!(matches!(paper_size("A4"), Some(PaperSize::A4)));
        assert!(matches!(paper_size("Letter"), Some(PaperSize::Letter)));
        assert!(matches!(paper_size("LEGAL"), Some(PaperSize::Legal)));
        assert!(paper_size("tabloid").is_none());
    }

    #[test]
    fn test_missing_font_is_reported() {
        let err = match PdfProcessor::from_font_file(Path::new("/nonexistent/font.ttf")) {
            Err(err) => err,
            Ok(_) => panic!("expected a font error"),
        };

        assert!(matches!(err, FontError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/font.ttf"));
    }
}
