use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobType;

/// Per-model context shared by every job in one planning pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassContext {
    pub project_id: Uuid,
    pub model_id: String,
    pub wallet_id: String,
    pub auth_token: String,
    pub continue_until_complete: bool,
    /// Lineage shared by every artifact this pass produces.
    pub source_group: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPayload {
    pub pass: PassContext,
    pub user_id: String,
}

/// Continuation bookkeeping for a truncated EXECUTE job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    /// Number of continuations requested so far; also the next chunk's turn index.
    pub count: u32,
    /// Resource id of the first chunk.
    pub root_contribution_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub pass: PassContext,
    pub step_slug: String,
    pub document_key: String,
    #[serde(default)]
    pub source_anchor_model_slug: Option<String>,
    #[serde(default)]
    pub continuation: Option<Continuation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderPayload {
    pub pass: PassContext,
    pub step_slug: String,
    pub document_key: String,
    pub root_contribution_id: Uuid,
    #[serde(default)]
    pub source_anchor_model_slug: Option<String>,
}

/// Job payload, tagged by job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    Plan(PlanPayload),
    Execute(ExecutePayload),
    Render(RenderPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Plan(_) => JobType::Plan,
            JobPayload::Execute(_) => JobType::Execute,
            JobPayload::Render(_) => JobType::Render,
        }
    }

    pub fn pass(&self) -> &PassContext {
        match self {
            JobPayload::Plan(p) => &p.pass,
            JobPayload::Execute(p) => &p.pass,
            JobPayload::Render(p) => &p.pass,
        }
    }

    pub fn step_slug(&self) -> Option<&str> {
        match self {
            JobPayload::Plan(_) => None,
            JobPayload::Execute(p) => Some(&p.step_slug),
            JobPayload::Render(p) => Some(&p.step_slug),
        }
    }

    /// Check the payload against the job row it was loaded from.
    pub fn validate(&self, expected: JobType) -> Result<(), String> {
        if self.job_type() != expected {
            return Err(format!(
                "payload is tagged {} but the job is {expected}",
                self.job_type()
            ));
        }
        if self.pass().model_id.trim().is_empty() {
            return Err("payload has no model_id".into());
        }
        match self {
            JobPayload::Plan(p) if p.user_id.trim().is_empty() => {
                Err("plan payload has no user_id".into())
            }
            JobPayload::Execute(p) if p.step_slug.is_empty() || p.document_key.is_empty() => {
                Err("execute payload needs step_slug and document_key".into())
            }
            JobPayload::Render(p) if p.step_slug.is_empty() || p.document_key.is_empty() => {
                Err("render payload needs step_slug and document_key".into())
            }
            _ => Ok(()),
        }
    }
}
