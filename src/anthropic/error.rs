//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] com variantes para rate limiting, erros da API
//! e erros de rede, e a classificação entre falhas transitórias e definitivas
//! usada pela política de retentativa dos jobs.

use thiserror::Error;

use crate::model::ModelCallError;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Rate limit, 408, 5xx (incluindo 529 "overloaded") e falhas de rede são transitórios.
    pub fn is_retryable(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. } | AnthropicError::NetworkError(_) => true,
            AnthropicError::ApiError { status, .. } => *status == 408 || *status >= 500,
        }
    }
}

impl From<AnthropicError> for ModelCallError {
    fn from(err: AnthropicError) -> Self {
        ModelCallError {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}
