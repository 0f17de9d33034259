//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use verdant_infra::BrokerConfig;

#[cfg(feature = "scheduler")]
use crate::background::SchedulerConfig;

const DEFAULT_PDF_FONT: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub broker: BrokerConfig,
    /// TrueType font for rendered PDFs.
    pub pdf_font_path: PathBuf,
    #[cfg(feature = "scheduler")]
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            broker: BrokerConfig::from_env(),
            pdf_font_path: env::var("PDF_FONT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_PDF_FONT)),
            #[cfg(feature = "scheduler")]
            scheduler: SchedulerConfig::from_env(),
        }
    }
}
