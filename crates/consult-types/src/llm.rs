//! Generation backend request/response types.
//!
//! The language-generation backend is an external collaborator; only the
//! shape of one non-streaming completion call is modelled here.

use serde::{Deserialize, Serialize};

use crate::chat::MessageRole;

/// One turn of conversation sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Request to the generation backend for a single reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    /// Role framing and session context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Successful response from the generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Errors from the generation backend.
///
/// These never reach a chat client: the synthesizer absorbs every variant
/// into its fallback path.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("backend returned HTTP {status}")]
    Status { status: u16 },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("backend timed out after {0}ms")]
    Timeout(u64),

    #[error("backend returned empty content")]
    EmptyContent,

    #[error("generation cancelled")]
    Cancelled,

    #[error("backend not configured")]
    NotConfigured,
}
