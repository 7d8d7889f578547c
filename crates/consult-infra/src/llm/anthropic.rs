//! AnthropicBackend: [`GenerationBackend`] over the Anthropic Messages API.
//!
//! One non-streaming `POST /v1/messages` per reply. The API key is wrapped
//! in [`SecretString`] and only exposed when building request headers.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use consult_core::llm::backend::GenerationBackend;
use consult_types::llm::{GenerationError, GenerationRequest, GenerationResponse};

// AnthropicBackend does not derive Debug so the client state is never printed.
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl AnthropicBackend {
    /// The Anthropic API version header value.
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(api_key: SecretString) -> Self {
        // The synthesizer enforces the generation timeout; this is a backstop.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (proxies, tests).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn to_anthropic_request(request: &GenerationRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            system: request.system.clone(),
            stream: false,
            temperature: request.temperature,
        }
    }
}

impl GenerationBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let body = Self::to_anthropic_request(request);

        let response = self
            .client
            .post(self.url("/v1/messages"))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Backend {
                message: format!("HTTP request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: AnthropicResponse = response.json().await.map_err(|e| {
            GenerationError::Deserialization(format!("failed to parse response: {e}"))
        })?;

        Ok(GenerationResponse {
            content: parsed.text(),
            model: parsed.model,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

impl AnthropicResponse {
    /// Concatenated text blocks; non-text blocks are skipped.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
                AnthropicContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_types::chat::MessageRole;
    use consult_types::llm::PromptMessage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            system: Some("You are a consultant.".to_string()),
            messages: vec![
                PromptMessage {
                    role: MessageRole::User,
                    content: "What will this cost?".to_string(),
                },
                PromptMessage {
                    role: MessageRole::Assistant,
                    content: "It depends.".to_string(),
                },
            ],
            max_tokens: 256,
            temperature: Some(0.4),
        }
    }

    /// Serve one canned HTTP response and hand back the raw request text.
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let content_length = text[..split]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_request_serialization() {
        let body = AnthropicBackend::to_anthropic_request(&request());
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "claude-sonnet-4-20250514");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["stream"], false);
        assert_eq!(json["system"], "You are a consultant.");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][1]["role"], "assistant");
    }

    #[test]
    fn test_response_text_skips_non_text_blocks() {
        let json = r#"{
            "id": "msg_1",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "Roughly "},
                {"type": "tool_use", "id": "t1", "name": "calc", "input": {}},
                {"type": "text", "text": "two sprints."}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        }"#;
        let resp: AnthropicResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.text(), "Roughly two sprints.");
        assert_eq!(resp.usage.output_tokens, 4);
    }

    #[tokio::test]
    async fn test_generate_against_local_server() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 200 OK",
            r#"{"id":"msg_1","model":"claude-sonnet-4-20250514","content":[{"type":"text","text":"Hello there"}],"usage":{"input_tokens":3,"output_tokens":2}}"#,
        )
        .await;

        let backend = AnthropicBackend::new(SecretString::from("sk-test-key")).with_base_url(url);
        let response = backend.generate(&request()).await.unwrap();
        assert_eq!(response.content, "Hello there");
        assert_eq!(response.input_tokens, 3);

        let raw = server.await.unwrap().to_ascii_lowercase();
        assert!(raw.starts_with("post /v1/messages"));
        assert!(raw.contains("x-api-key: sk-test-key"));
        assert!(raw.contains("anthropic-version: 2023-06-01"));
    }

    #[tokio::test]
    async fn test_generate_maps_http_status() {
        let (url, _server) = one_shot_server(
            "HTTP/1.1 529 Site Overloaded",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .await;

        let backend = AnthropicBackend::new(SecretString::from("sk-test-key")).with_base_url(url);
        let err = backend.generate(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Status { status: 529 }));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_backend_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = AnthropicBackend::new(SecretString::from("sk-test-key"))
            .with_base_url(format!("http://{addr}/"));
        let err = backend.generate(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Backend { .. }));
    }
}
