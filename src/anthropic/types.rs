//! Tipos de dados para requisições e respostas da API Anthropic Messages.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON
//! conforme o formato esperado pelo endpoint `v1/messages` da Anthropic.

use serde::{Deserialize, Serialize};

use crate::model::{ChatMessage, ModelRequest};

/// Corpo da requisição para o endpoint `/v1/messages` da API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Identificador do modelo a ser usado (ex.: "claude-sonnet-4-5-20250929").
    pub model: String,
    /// Número máximo de tokens na resposta gerada pelo modelo.
    pub max_tokens: u32,
    /// Instrução de sistema opcional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Lista de mensagens compondo a conversa (usuário e assistente).
    pub messages: Vec<Message>,
}

impl From<&ModelRequest> for MessagesRequest {
    fn from(req: &ModelRequest) -> Self {
        Self {
            model: req.api_identifier.clone(),
            max_tokens: req.max_tokens,
            system: req.system.clone(),
            messages: req.messages.iter().map(Message::from).collect(),
        }
    }
}

/// Uma única mensagem em uma conversa com a API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Papel do remetente: "user" ou "assistant".
    pub role: String,
    /// Conteúdo textual da mensagem.
    pub content: String,
}

impl From<&ChatMessage> for Message {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.clone(),
            content: msg.content.clone(),
        }
    }
}

/// Resposta retornada pelo endpoint `/v1/messages` da API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Identificador único da resposta (gerado pela API).
    pub id: String,
    /// Blocos de conteúdo na resposta (normalmente texto).
    pub content: Vec<ContentBlock>,
    /// Modelo que gerou a resposta.
    pub model: String,
    /// Motivo da parada da geração (ex.: "end_turn", "max_tokens").
    pub stop_reason: Option<String>,
    /// Estatísticas de uso de tokens (entrada e saída).
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatena o texto de todos os blocos do tipo "text".
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect()
    }
}

/// Um bloco de conteúdo dentro da resposta.
///
/// O campo `content_type` é serializado como `"type"` no JSON via `serde(rename)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    /// Blocos que não são de texto chegam sem este campo.
    #[serde(default)]
    pub text: String,
}

/// Estatísticas de consumo de tokens para uma chamada à API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::OutputFormat;

    #[test]
    fn request_built_from_model_request() {
        let req = ModelRequest {
            model_id: "claude-sonnet".into(),
            api_identifier: "claude-sonnet-4-5-20250929".into(),
            max_tokens: 4096,
            system: None,
            messages: vec![ChatMessage::user("Hello"), ChatMessage::assistant("Hi")],
            response_format: OutputFormat::Markdown,
        };
        let api = MessagesRequest::from(&req);
        assert_eq!(api.model, "claude-sonnet-4-5-20250929");
        assert_eq!(api.messages.len(), 2);
        assert_eq!(api.messages[1].role, "assistant");

        let json = serde_json::to_string(&api).unwrap();
        assert!(!json.contains("system"));
    }

    #[test]
    fn messages_response_deserialize_from_api_format() {
        let api_json = r#"{
            "id": "msg_123",
            "content": [
                {"type": "text", "text": "Response "},
                {"type": "tool_use"},
                {"type": "text", "text": "here"}
            ],
            "model": "claude-sonnet-4-5-20250929",
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 5, "output_tokens": 15}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(api_json).unwrap();
        assert_eq!(resp.id, "msg_123");
        assert_eq!(resp.text(), "Response here");
        assert_eq!(resp.stop_reason.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn messages_response_null_stop_reason() {
        let json = r#"{
            "id": "msg_456",
            "content": [],
            "model": "test",
            "stop_reason": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.stop_reason, None);
        assert_eq!(resp.text(), "");
    }
}
