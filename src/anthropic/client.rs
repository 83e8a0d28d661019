use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::error::AnthropicError;
use super::types::{MessagesRequest, MessagesResponse};
use crate::model::{FinishReason, ModelCallError, ModelCaller, ModelRequest, ModelResponse};

const API_URL: &str = "https://api.anthropic.com/v1/messages";

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, request_timeout: Duration) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string(), request_timeout)
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: String,
        base_url: String,
        request_timeout: Duration,
    ) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }

    pub async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }
}

#[async_trait]
impl ModelCaller for AnthropicClient {
    /// The provider authenticates with the API key; `auth_token` belongs to
    /// the caller's session and is not forwarded.
    async fn call_model(
        &self,
        request: &ModelRequest,
        _auth_token: &str,
    ) -> Result<ModelResponse, ModelCallError> {
        let started = Instant::now();
        let body = self.send_message(&MessagesRequest::from(request)).await?;
        let processing_time_ms = started.elapsed().as_millis() as u64;

        debug!(
            model = %body.model,
            stop_reason = ?body.stop_reason,
            output_tokens = body.usage.output_tokens,
            "anthropic response"
        );

        let raw_provider_response = serde_json::to_value(&body)
            .map_err(|e| ModelCallError::retryable(format!("unreadable provider response: {e}")))?;

        Ok(ModelResponse {
            content: body.text(),
            finish_reason: FinishReason::from_provider(body.stop_reason.as_deref()),
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
            processing_time_ms,
            raw_provider_response,
        })
    }
}
