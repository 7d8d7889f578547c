//! Thin HTTP client for the `/api/v1` endpoints the terminal chat needs.
//!
//! Unwraps the response envelope and turns error envelopes into
//! [`ClientError::Api`] with the server's machine-readable code.

use std::time::Duration;

use consult_types::chat::{ChatMessage, ChatSession, SessionContext};
use consult_types::transport::{NegotiatorConfig, RequestedMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
}

impl ClientError {
    /// The server's error code, when it answered with one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            ClientError::Transport(_) => None,
        }
    }

    /// Failures worth renegotiating the transport for: the request never
    /// got an answer, or the server is temporarily unavailable.
    pub fn is_connectivity(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: String,
    message: String,
}

/// User message plus reply, as returned by `POST /sessions/{id}/messages`.
#[derive(Debug, Deserialize)]
pub struct ExchangeBody {
    pub user: ChatMessage,
    pub assistant: ChatMessage,
}

#[derive(Serialize)]
struct SendBody<'a> {
    content: &'a str,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        // Long enough for a full generation round trip on message sends.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `ws://` / `wss://` URL of the push channel.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}/api/v1/ws/chat")
    }

    pub async fn negotiator_config(&self) -> Result<NegotiatorConfig, ClientError> {
        self.send(self.http.get(self.url("/chat/config"))).await
    }

    pub async fn create_session(&self, context: &SessionContext) -> Result<ChatSession, ClientError> {
        self.send(self.http.post(self.url("/sessions")).json(context)).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<ChatSession, ClientError> {
        self.send(self.http.get(self.url(&format!("/sessions/{session_id}")))).await
    }

    /// Pull read: messages after `after`.
    pub async fn history_since(
        &self,
        session_id: Uuid,
        after: u64,
        mode: RequestedMode,
    ) -> Result<Vec<ChatMessage>, ClientError> {
        let request = self
            .http
            .get(self.url(&format!("/sessions/{session_id}/history")))
            .query(&[("since", after.to_string()), ("mode", mode.to_string())]);
        self.send(request).await
    }

    pub async fn send_message(&self, session_id: Uuid, content: &str) -> Result<ExchangeBody, ClientError> {
        let request = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/messages")))
            .json(&SendBody { content });
        self.send(request).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ClientError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let envelope: Envelope<T> = response.json().await?;

        if let Some(error) = envelope.errors.into_iter().next() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                code: error.code,
                message: error.message,
            });
        }
        envelope.data.ok_or_else(|| ClientError::Api {
            status: status.as_u16(),
            code: "EMPTY_RESPONSE".to_string(),
            message: format!("no data in {status} response"),
        })
    }
}
