use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportMode;

/// Errors from repository operations (used by trait definitions in consult-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Synchronous request validation failures. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("message content exceeds {max} characters")]
    ContentTooLong { max: usize },

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("session {0} is closed")]
    SessionClosed(Uuid),

    #[error("{0}")]
    Invalid(String),
}

/// Errors surfaced by the chat subsystem to its callers.
///
/// Generation backend failures are absent: they are absorbed
/// by the response synthesizer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The session exists but belongs to another principal.
    #[error("session {0} is not accessible")]
    Forbidden(Uuid),

    /// Forced-mode reconnect attempts exhausted.
    #[error("{mode} transport unavailable after {attempts} attempts")]
    Connectivity { mode: TransportMode, attempts: u32 },

    #[error("storage unavailable: {0}")]
    Storage(#[from] RepositoryError),
}

impl ChatError {
    pub fn is_storage(&self) -> bool {
        matches!(self, ChatError::Storage(_))
    }
}

/// Transport-level failures, handled internally by the negotiator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("attach failed: {0}")]
    AttachFailed(String),

    #[error("attach timed out after {0}ms")]
    AttachTimedOut(u64),

    #[error("transport disconnected")]
    Disconnected,

    #[error("send timed out")]
    SendTimedOut,

    /// The server told the client to use another transport.
    #[error("redirected to {0} transport")]
    Redirected(TransportMode),
}

/// Token verification failures. Rejected before any session logic runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,

    #[error("invalid token")]
    Invalid,

    #[error("token expired")]
    Expired,

    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}
