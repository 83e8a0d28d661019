use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::anthropic::AnthropicError;
use crate::artifact::StorageError;
use crate::model::ModelCallError;
use crate::state_machine::JobStatus;

pub type Result<T> = std::result::Result<T, DialecticError>;

#[derive(Debug, Error)]
pub enum DialecticError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Model error: {0}")]
    Model(#[from] ModelCallError),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DialecticError {
    /// HTTP-equivalent status for callers that surface errors over an API.
    pub fn status(&self) -> u16 {
        match self {
            DialecticError::Validation(_) => 400,
            DialecticError::NotFound(_) => 404,
            DialecticError::Conflict(_) | DialecticError::InvalidTransition { .. } => 409,
            _ => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DialecticError::Validation(_) => "VALIDATION_ERROR",
            DialecticError::NotFound(_) => "NOT_FOUND",
            DialecticError::Conflict(_) => "CONFLICT",
            DialecticError::InvalidTransition { .. } => "INVALID_TRANSITION",
            DialecticError::Store(_) => "STORE_ERROR",
            DialecticError::Config(_) => "CONFIG_ERROR",
            DialecticError::Worker(_) => "WORKER_ERROR",
            DialecticError::Storage(_) => "STORAGE_ERROR",
            DialecticError::Model(_) | DialecticError::Anthropic(_) => "MODEL_ERROR",
            DialecticError::Io(_) => "IO_ERROR",
            DialecticError::Json(_) | DialecticError::Toml(_) => "PARSE_ERROR",
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        let details = match self {
            DialecticError::InvalidTransition { job_id, from, to } => Some(serde_json::json!({
                "job_id": job_id,
                "from": from,
                "to": to,
            })),
            _ => None,
        };
        ApiError {
            message: self.to_string(),
            status: self.status(),
            code: self.code().to_string(),
            details,
        }
    }
}

/// Structured error returned to callers of the enqueue operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<DialecticError> for ApiError {
    fn from(err: DialecticError) -> Self {
        err.to_api_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(DialecticError::Validation("x".into()).status(), 400);
        assert_eq!(DialecticError::NotFound("x".into()).status(), 404);
        assert_eq!(DialecticError::Conflict("x".into()).status(), 409);
        assert_eq!(DialecticError::Store("x".into()).status(), 500);
    }

    #[test]
    fn api_error_omits_missing_details() {
        let api = DialecticError::Validation("walletId is required".into()).to_api_error();
        assert_eq!(api.code, "VALIDATION_ERROR");
        assert_eq!(api.message, "Validation error: walletId is required");

        let json = serde_json::to_string(&api).unwrap();
        assert!(!json.contains("details"));
    }

    #[test]
    fn invalid_transition_carries_details() {
        let err = DialecticError::InvalidTransition {
            job_id: Uuid::nil(),
            from: JobStatus::Completed,
            to: JobStatus::Processing,
        };
        let api = ApiError::from(err);
        assert_eq!(api.status, 409);
        let details = api.details.unwrap();
        assert_eq!(details["from"], "completed");
        assert_eq!(details["to"], "processing");
    }
}
