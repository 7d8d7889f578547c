//! Chat session and message types.
//!
//! These types model conversations between a client and the consultant
//! assistant: sessions with their client-provided context, and the ordered,
//! immutable messages appended to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::transport::TransportMode;

/// Lifecycle status of a chat session.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (status IN ('active', 'idle', 'closed'))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Idle,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "idle" => Ok(SessionStatus::Idle),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(format!("invalid session status: '{other}'")),
        }
    }
}

/// Role of a message author within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// Optional urgency hint supplied by the client when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("invalid priority: '{other}'")),
        }
    }
}

/// Client-provided context attached to a session at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionContext {
    /// Free-text label, e.g. "cost review".
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// A chat session between a principal and the consultant assistant.
///
/// Owned exclusively by the session store. Message logs and connection
/// state refer to it by `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    /// Principal that created the session.
    pub owner: String,
    pub context: SessionContext,
    pub status: SessionStatus,
    /// Transport the most recent client attachment negotiated, if any.
    pub transport_mode: Option<TransportMode>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    /// Build a fresh active session for `owner`.
    pub fn new(owner: impl Into<String>, context: SessionContext) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner: owner.into(),
            context,
            status: SessionStatus::Active,
            transport_mode: None,
            created_at: now,
            last_activity_at: now,
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }
}

/// A single message within a chat session.
///
/// `sequence` starts at 1 and increases by exactly one per append within
/// the session. Messages are never edited or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing sessions. All fields are optional and combined with AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    pub owner: Option<String>,
    pub status: Option<SessionStatus>,
    /// Case-insensitive substring match on the context label.
    pub label_contains: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Partial update applied through `PUT /sessions/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub label: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<SessionStatus>,
}

/// Offset pagination for full history retrieval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}
