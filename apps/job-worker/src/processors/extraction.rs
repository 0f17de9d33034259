//! Data extraction - fetch a page and pull contact fields out of its HTML.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use verdant_core::domain::{DataExtractionPayload, Job, JobOutput, JobPayload};
use verdant_core::ports::{JobProcessor, ProcessorError, ProgressReporter};

const SUPPORTED_FIELDS: [&str; 7] = [
    "title",
    "company_name",
    "email",
    "phone",
    "address",
    "website",
    "description",
];
const TITLE_SUFFIXES: [&str; 4] = [" - Home", " | Home", " - Official Site", " | Official Site"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));
static META_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\s[^>]*>").expect("valid meta regex"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z:-]+)\s*=\s*["']([^"']*)["']"#).expect("valid attribute regex")
});
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}")
        .expect("valid email regex")
});
static TEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href=["']tel:([^"']+)["']"#).expect("valid tel regex"));
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+?\(?\d[\d\s().-]{7,}\d").expect("valid phone regex")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static IMG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\s[^>]*>").expect("valid img regex"));
static LOGO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)logo").expect("valid logo regex"));
static ADDRESS_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<address[^>]*>(.*?)</address>").expect("valid address regex")
});
/// US ZIP or UK postcode.
static POSTCODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{5}(?:-\d{4})?|[A-Z]{1,2}\d[A-Z\d]?\s\d[A-Z]{2})\b")
        .expect("valid postcode regex")
});

pub struct ExtractionProcessor {
    client: reqwest::Client,
}

impl ExtractionProcessor {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("verdant-job-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &reqwest::Url) -> Result<(reqwest::Url, String), ProcessorError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ProcessorError::retryable(format!("Failed to fetch {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProcessorError::permanent(format!(
                "Source returned HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        let final_url = response.url().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ProcessorError::retryable(format!("Failed to read {}: {}", url, e)))?;
        Ok((final_url, body))
    }
}

fn parse_source(raw: &str) -> Result<reqwest::Url, ProcessorError> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| ProcessorError::permanent(format!("Invalid source URL {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProcessorError::permanent(format!(
            "Unsupported URL scheme: {}",
            other
        ))),
    }
}

/// Requested fields, or every supported field when none were named.
fn requested_fields(payload: &DataExtractionPayload) -> Vec<String> {
    if payload.target_fields.is_empty() {
        SUPPORTED_FIELDS.iter().map(|f| f.to_string()).collect()
    } else {
        payload.target_fields.clone()
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn meta_content(html: &str, name: &str) -> Option<String> {
    META_RE.find_iter(html).find_map(|tag| {
        let mut matches_name = false;
        let mut content = None;
        for attr in ATTR_RE.captures_iter(tag.as_str()) {
            let key = attr[1].to_ascii_lowercase();
            let value = &attr[2];
            match key.as_str() {
                "name" | "property" if value.eq_ignore_ascii_case(name) => matches_name = true,
                "content" => content = Some(collapse_whitespace(value)),
                _ => {}
            }
        }
        content.filter(|c| matches_name && !c.is_empty())
    })
}

fn extract_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .map(|c| collapse_whitespace(&c[1]))
        .filter(|t| !t.is_empty())
        .or_else(|| meta_content(html, "og:site_name"))
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    ATTR_RE
        .captures_iter(tag)
        .find(|attr| attr[1].eq_ignore_ascii_case(name))
        .map(|attr| attr[2].to_string())
}

/// Logo alt text, then the page title, then the domain.
fn extract_company_name(html: &str, source: &reqwest::Url) -> Option<String> {
    let from_logo = IMG_RE.find_iter(html).find_map(|img| {
        let alt = attribute(img.as_str(), "alt")?;
        if !LOGO_RE.is_match(&alt) {
            return None;
        }
        Some(collapse_whitespace(&LOGO_RE.replace_all(&alt, "")))
            .filter(|name| !name.is_empty())
    });
    if from_logo.is_some() {
        return from_logo;
    }

    let from_title = TITLE_RE.captures(html).and_then(|c| {
        let mut title = collapse_whitespace(&c[1]);
        for suffix in TITLE_SUFFIXES {
            title = title.replace(suffix, "");
        }
        Some(title.trim().to_string()).filter(|t| !t.is_empty())
    });
    if from_title.is_some() {
        return from_title;
    }

    let host = source.host_str()?;
    let label = host.strip_prefix("www.").unwrap_or(host).split('.').next()?;
    let mut chars = label.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// Contents of an `<address>` element, or the first text line carrying a
/// postcode.
fn extract_address(html: &str) -> Option<String> {
    if let Some(found) = ADDRESS_TAG_RE.captures(html) {
        let address = collapse_whitespace(&TAG_RE.replace_all(&found[1], " "));
        if !address.is_empty() {
            return Some(address);
        }
    }

    let text = TAG_RE.replace_all(html, "\n");
    text.lines()
        .map(collapse_whitespace)
        .find(|line| (20..=200).contains(&line.len()) && POSTCODE_RE.is_match(line))
}

fn extract_email(html: &str) -> Option<String> {
    EMAIL_RE
        .find_iter(html)
        .map(|m| m.as_str())
        .find(|email| {
            // Asset names like logo@2x.png look like addresses.
            let lower = email.to_ascii_lowercase();
            ![".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"]
                .iter()
                .any(|ext| lower.ends_with(ext))
        })
        .map(str::to_string)
}

fn digit_count(text: &str) -> usize {
    text.chars().filter(char::is_ascii_digit).count()
}

fn extract_phone(html: &str) -> Option<String> {
    if let Some(tel) = TEL_RE.captures(html) {
        return Some(tel[1].trim().to_string());
    }

    let text = TAG_RE.replace_all(html, " ");
    PHONE_RE
        .find_iter(&text)
        .map(|m| m.as_str().trim().to_string())
        .find(|candidate| (9..=15).contains(&digit_count(candidate)))
}

fn extract_fields(html: &str, source: &reqwest::Url, fields: &[String]) -> Map<String, Value> {
    let mut data = Map::new();
    for field in fields {
        let value = match field.as_str() {
            "title" => extract_title(html),
            "company_name" | "companyName" => extract_company_name(html, source),
            "email" => extract_email(html),
            "phone" => extract_phone(html),
            "address" => extract_address(html),
            "website" => Some(source.origin().ascii_serialization()),
            "description" => meta_content(html, "description")
                .or_else(|| meta_content(html, "og:description")),
            other => {
                tracing::debug!(field = %other, "Unsupported extraction field");
                None
            }
        };
        data.insert(field.clone(), value.map(Value::String).unwrap_or(Value::Null));
    }
    data
}

#[async_trait]
impl JobProcessor for ExtractionProcessor {
    async fn process(
        &self,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<JobOutput, ProcessorError> {
        let JobPayload::DataExtraction(payload) = &job.payload else {
            return Err(ProcessorError::permanent("expected a data_extraction payload"));
        };

        let source = parse_source(&payload.source_url)?;
        progress.report(10).await;

        let (final_url, html) = self.fetch(&source).await?;
        progress.report(60).await;

        let data = extract_fields(&html, &final_url, &requested_fields(payload));
        tracing::debug!(
            job_id = %job.id,
            source = %source,
            fields = data.len(),
            "Data extracted"
        );
        progress.report(100).await;

        Ok(JobOutput::json(json!({
            "success": true,
            "sourceUrl": payload.source_url,
            "extractionType": payload.extraction_type,
            "data": data,
        })))
    }
}
