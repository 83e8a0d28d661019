use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::JobPayload;
use super::state::JobStatus;
use crate::session::Stage;

/// Distinguishes between logic failures and infrastructure failures.
/// Only system failures are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Request or configuration problem (missing wallet, bad payload, missing inputs).
    Business(String),
    /// Infrastructure failed (model timeout, rate limit, storage error).
    System(String),
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::System(_))
    }

    pub fn message(&self) -> &str {
        match self {
            FailureKind::Business(msg) | FailureKind::System(msg) => msg,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business(msg) => write!(f, "Business failure: {msg}"),
            FailureKind::System(msg) => write!(f, "System failure: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Plan,
    Execute,
    Render,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Plan => write!(f, "PLAN"),
            JobType::Execute => write!(f, "EXECUTE"),
            JobType::Render => write!(f, "RENDER"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Default attempt budget for new root jobs.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Failure recorded on the job row by the last failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// A single row in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub session_id: Uuid,
    pub parent_job_id: Option<Uuid>,
    /// Equals `id` for root jobs.
    pub root_job_id: Uuid,
    pub prerequisite_job_id: Option<Uuid>,
    pub job_type: JobType,
    pub stage_slug: Stage,
    pub iteration_number: u32,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub is_test_job: bool,
    pub error_details: Option<ErrorDetails>,
    pub results: Option<serde_json::Value>,
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A root job. Roots are the only jobs without a parent.
    pub fn root(
        session_id: Uuid,
        stage_slug: Stage,
        iteration_number: u32,
        payload: JobPayload,
        max_retries: u32,
        is_test_job: bool,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            session_id,
            parent_job_id: None,
            root_job_id: id,
            prerequisite_job_id: None,
            job_type: payload.job_type(),
            stage_slug,
            iteration_number,
            status: JobStatus::Pending,
            payload,
            attempt_count: 0,
            max_retries,
            is_test_job,
            error_details: None,
            results: None,
            retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// A child of `parent`, inheriting its session, stage, root and retry budget.
    pub fn child(parent: &Job, payload: JobPayload) -> Self {
        let mut job = Self::root(
            parent.session_id,
            parent.stage_slug,
            parent.iteration_number,
            payload,
            parent.max_retries,
            parent.is_test_job,
        );
        job.parent_job_id = Some(parent.id);
        job.root_job_id = parent.root_job_id;
        job
    }

    /// Park this job until `prerequisite` reaches a terminal status.
    pub fn waiting_on(mut self, prerequisite: Uuid) -> Self {
        self.prerequisite_job_id = Some(prerequisite);
        self.status = JobStatus::WaitingForPrerequisite;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_job_id.is_none()
    }

    pub fn is_root_plan(&self) -> bool {
        self.is_root() && self.job_type == JobType::Plan
    }
}

/// Compact view of a job for status reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub parent_job_id: Option<Uuid>,
    pub job_type: JobType,
    pub stage_slug: Stage,
    pub status: JobStatus,
    pub step_slug: Option<String>,
    pub model_id: String,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub error: Option<ErrorDetails>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl JobSummary {
    pub fn from_job(job: &Job) -> Self {
        let duration_ms = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        Self {
            job_id: job.id,
            parent_job_id: job.parent_job_id,
            job_type: job.job_type,
            stage_slug: job.stage_slug,
            status: job.status,
            step_slug: job.payload.step_slug().map(str::to_string),
            model_id: job.payload.pass().model_id.clone(),
            attempt_count: job.attempt_count,
            max_retries: job.max_retries,
            error: job.error_details.clone(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms,
        }
    }
}
