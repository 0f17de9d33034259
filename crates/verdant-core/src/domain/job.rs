//! Job record - one unit of submitted work plus its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job_type::{JobPayload, JobType};
use super::output::JobOutput;

/// Default maximum number of processor attempts.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Submission-time policy for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Higher values dequeue first.
    #[serde(default)]
    pub priority: i32,
    /// Milliseconds before the job becomes eligible.
    #[serde(default, rename = "delay")]
    pub delay_ms: u64,
    /// Maximum processor attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay_ms: 0,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// What a caller hands to `add_job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    pub user_id: String,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl JobData {
    pub fn new(user_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            job_id: None,
            user_id: user_id.into(),
            payload,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }
}

/// Stored lifecycle state. `not_found` is never stored; see `JobStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A job as held by a broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub progress: u8,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobOutput>,
    pub error: Option<String>,
}

impl Job {
    /// Build a queued job from submission data, generating an id if needed.
    pub fn new(data: JobData, options: JobOptions) -> Self {
        let job_type = data.job_type();
        let id = data
            .job_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_job_id(job_type));

        Self {
            id,
            user_id: data.user_id,
            payload: data.payload,
            options: JobOptions {
                attempts: options.attempts.max(1),
                ..options
            },
            state: JobState::Queued,
            attempts_made: 0,
            progress: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Claimed by a worker.
    pub fn activate(&mut self) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.started_at = Some(Utc::now());
        self.error = None;
    }

    pub fn report_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    pub fn complete(&mut self, output: JobOutput) {
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(output);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = JobState::Failed;
        self.error = Some(message.into());
        self.finished_at = Some(Utc::now());
    }

    /// Back to the queue after a retryable failure.
    pub fn requeue(&mut self, message: impl Into<String>) {
        self.state = JobState::Queued;
        self.progress = 0;
        self.error = Some(message.into());
    }

    /// Whether another attempt is allowed after the current one.
    #[inline]
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.options.attempts
    }
}

/// Generate a job id of the form `{type}_{unix_millis}_{base36}`.
pub fn generate_job_id(job_type: JobType) -> String {
    format!(
        "{}_{}_{}",
        job_type.as_str(),
        Utc::now().timestamp_millis(),
        random_base36(9)
    )
}

fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut n = uuid::Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        out.push(ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job_type::{LcaCalculationPayload, LcaOptions};
    use serde_json::json;

    fn lca_data() -> JobData {
        JobData::new(
            "user-1",
            JobPayload::LcaCalculation(LcaCalculationPayload {
                product_id: "prod-1".to_string(),
                calculation_method: "ISO14040".to_string(),
                options: LcaOptions::default(),
            }),
        )
    }

    fn is_generated_id(id: &str, job_type: JobType) -> bool {
        let Some(rest) = id.strip_prefix(&format!("{}_", job_type.as_str())) else {
            return false;
        };
        let Some((millis, suffix)) = rest.split_once('_') else {
            return false;
        };
        !millis.is_empty()
            && millis.chars().all(|c| c.is_ascii_digit())
            && !suffix.is_empty()
            && suffix
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
    }

    #[test]
    fn test_generated_id_matches_pattern() {
        for job_type in JobType::ALL {
            let id = generate_job_id(job_type);
            assert!(is_generated_id(&id, job_type), "bad id: {id}");
        }
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_job_id(JobType::ReportExport);
        let b = generate_job_id(JobType::ReportExport);
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_job_keeps_supplied_id() {
        let job = Job::new(lca_data().with_job_id("custom-1"), JobOptions::default());
        assert_eq!(job.id, "custom-1");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.job_type(), JobType::LcaCalculation);
    }

    #[test]
    fn test_new_job_generates_id_when_missing() {
        let job = Job::new(lca_data(), JobOptions::default());
        assert!(is_generated_id(&job.id, JobType::LcaCalculation));
    }

    #[test]
    fn test_zero_attempts_normalized() {
        let job = Job::new(lca_data(), JobOptions::default().with_attempts(0));
        assert_eq!(job.options.attempts, 1);
    }

    #[test]
    fn test_retry_bookkeeping() {
        let mut job = Job::new(lca_data(), JobOptions::default().with_attempts(2));
        job.activate();
        assert!(job.can_retry());
        job.report_progress(60);
        job.requeue("flaky");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.progress, 0);
        job.activate();
        assert_eq!(job.attempts_made, 2);
        assert!(!job.can_retry());
        job.fail("still flaky");
        assert!(job.state.is_terminal());
        assert_eq!(job.error.as_deref(), Some("still flaky"));
    }

    #[test]
    fn test_options_defaults_from_json() {
        let options: JobOptions = serde_json::from_value(json!({ "priority": 5 })).unwrap();
        assert_eq!(options.priority, 5);
        assert_eq!(options.delay_ms, 0);
        assert_eq!(options.attempts, DEFAULT_ATTEMPTS);
    }

    #[test]
    fn test_job_data_flattens_payload() {
        let data: JobData = serde_json::from_value(json!({
            "type": "report_export",
            "userId": "user-9",
            "reportId": "rep-3",
            "exportFormat": "csv"
        }))
        .unwrap();

        assert_eq!(data.job_type(), JobType::ReportExport);
        assert!(data.job_id.is_none());
        assert_eq!(data.user_id, "user-9");
    }
}
