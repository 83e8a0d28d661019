//! The model-call seam: request/response shapes, the [`ModelCaller`] trait,
//! the model catalog and an offline stub.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recipe::OutputFormat;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model_id: String,
    /// Provider-side model name.
    pub api_identifier: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub response_format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Truncated,
    Other,
}

impl FinishReason {
    /// Only `length` and `truncated` trigger a continuation.
    pub fn needs_continuation(&self) -> bool {
        matches!(self, FinishReason::Length | FinishReason::Truncated)
    }

    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            None | Some("end_turn") | Some("stop") | Some("stop_sequence") => FinishReason::Stop,
            Some("max_tokens") | Some("length") => FinishReason::Length,
            Some("truncated") => FinishReason::Truncated,
            Some(_) => FinishReason::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub processing_time_ms: u64,
    pub raw_provider_response: serde_json::Value,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ModelCallError {
    pub message: String,
    /// Transient failures (rate limit, 5xx, network) are worth another attempt.
    pub retryable: bool,
}

impl ModelCallError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Calls an AI model on behalf of a job.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call_model(
        &self,
        request: &ModelRequest,
        auth_token: &str,
    ) -> Result<ModelResponse, ModelCallError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub api_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelInfo>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let model = |id: &str, name: &str, api: &str| ModelInfo {
            id: id.into(),
            display_name: name.into(),
            api_identifier: api.into(),
        };
        Self {
            models: vec![
                model("claude-haiku", "Claude Haiku", "claude-haiku-4-5-20251001"),
                model("claude-sonnet", "Claude Sonnet", "claude-sonnet-4-5-20250929"),
                model("claude-opus", "Claude Opus", "claude-opus-4-6"),
            ],
        }
    }
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }
}

/// Deterministic offline model. Answers JSON requests with a JSON object and
/// everything else with a short markdown draft.
#[derive(Debug, Clone, Default)]
pub struct StubModel;

#[async_trait]
impl ModelCaller for StubModel {
    async fn call_model(
        &self,
        request: &ModelRequest,
        _auth_token: &str,
    ) -> Result<ModelResponse, ModelCallError> {
        let topic = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content.lines().find(|l| !l.trim().is_empty()))
            .unwrap_or("untitled")
            .trim()
            .to_string();

        let content = match request.response_format {
            OutputFormat::Json => serde_json::json!({
                "model": request.api_identifier,
                "summary": topic,
            })
            .to_string(),
            OutputFormat::Markdown => {
                format!("# Draft by {}\n\n{topic}\n", request.api_identifier)
            }
        };
        let output_tokens = content.split_whitespace().count() as u32;

        Ok(ModelResponse {
            raw_provider_response: serde_json::json!({
                "provider": "stub",
                "content": content,
            }),
            content,
            finish_reason: FinishReason::Stop,
            input_tokens: 0,
            output_tokens,
            processing_time_ms: 0,
        })
    }
}
