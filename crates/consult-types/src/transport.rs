//! Transport negotiation types.
//!
//! A client attaches to a session over either a persistent push channel
//! (WebSocket) or periodic pull requests. The negotiator tracks each
//! attachment in a [`ConnectionState`] that lives only in memory.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::ChatMessage;

/// Transport actually in use for an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Push,
    Pull,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Push => write!(f, "push"),
            TransportMode::Pull => write!(f, "pull"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" => Ok(TransportMode::Push),
            "pull" => Ok(TransportMode::Pull),
            other => Err(format!("invalid transport mode: '{other}'")),
        }
    }
}

/// Transport requested by configuration or by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestedMode {
    #[default]
    Auto,
    Push,
    Pull,
}

impl RequestedMode {
    /// Forced modes never switch transport; they fail terminally instead.
    pub fn is_forced(self) -> bool {
        !matches!(self, RequestedMode::Auto)
    }
}

impl fmt::Display for RequestedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedMode::Auto => write!(f, "auto"),
            RequestedMode::Push => write!(f, "push"),
            RequestedMode::Pull => write!(f, "pull"),
        }
    }
}

impl FromStr for RequestedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(RequestedMode::Auto),
            "push" => Ok(RequestedMode::Push),
            "pull" => Ok(RequestedMode::Pull),
            other => Err(format!("invalid requested mode: '{other}'")),
        }
    }
}

/// Phase of the negotiation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    AttemptingPush,
    ConnectedPush,
    AttemptingPull,
    ConnectedPull,
    FallingBack,
    Reconnecting,
    Failed,
}

impl ConnectionPhase {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionPhase::ConnectedPush | ConnectionPhase::ConnectedPull
        )
    }
}

/// Per-attachment negotiation record.
///
/// Created when a client attaches, destroyed when it detaches or the
/// session closes. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub session_id: Uuid,
    pub requested_mode: RequestedMode,
    pub current_mode: Option<TransportMode>,
    pub phase: ConnectionPhase,
    pub consecutive_failures: u32,
    pub next_retry_not_before: Option<DateTime<Utc>>,
    pub terminal_failure: bool,
    /// Highest sequence number the client has acknowledged.
    pub last_acked_sequence: u64,
}

impl ConnectionState {
    pub fn new(session_id: Uuid, requested_mode: RequestedMode) -> Self {
        Self {
            session_id,
            requested_mode,
            current_mode: None,
            phase: ConnectionPhase::Disconnected,
            consecutive_failures: 0,
            next_retry_not_before: None,
            terminal_failure: false,
            last_acked_sequence: 0,
        }
    }
}

/// Negotiator configuration, also served to clients so they can self-configure.
///
/// Durations are carried as milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatorConfig {
    #[serde(default)]
    pub mode: RequestedMode,
    #[serde(default = "default_push_attach_timeout_ms", alias = "push_attach_timeout_ms")]
    pub push_attach_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms", alias = "poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts", alias = "max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_fallback_delay_ms", alias = "fallback_delay_ms")]
    pub fallback_delay_ms: u64,
}

fn default_push_attach_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_fallback_delay_ms() -> u64 {
    1_000
}

impl NegotiatorConfig {
    pub fn push_attach_timeout(&self) -> Duration {
        Duration::from_millis(self.push_attach_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            mode: RequestedMode::Auto,
            push_attach_timeout_ms: default_push_attach_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            fallback_delay_ms: default_fallback_delay_ms(),
        }
    }
}

/// Frames sent by the server over the push channel.
///
/// Externally tagged: `{"message": {...}}`, `{"error": "SESSION_CLOSED"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    Attached {
        session_id: Uuid,
        mode: TransportMode,
        /// Sequence the client should resume after (its last acknowledged one).
        resume_from: u64,
    },
    Message(ChatMessage),
    Error(String),
}

/// First frame a push client sends: establishes the session attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    pub session_id: Uuid,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub mode: RequestedMode,
}

/// Frames a push client sends after attaching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Send { content: String },
    Ack { ack: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_mode_forced() {
        assert!(!RequestedMode::Auto.is_forced());
        assert!(RequestedMode::Push.is_forced());
        assert!(RequestedMode::Pull.is_forced());
    }

    #[test]
    fn test_negotiator_config_wire_names() {
        let json = serde_json::to_value(NegotiatorConfig::default()).unwrap();
        assert_eq!(json["mode"], "auto");
        assert_eq!(json["pushAttachTimeoutMs"], 5_000);
        assert_eq!(json["maxReconnectAttempts"], 3);
        assert_eq!(json["fallbackDelayMs"], 1_000);
        assert_eq!(json["pollIntervalMs"], 2_000);
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let json = serde_json::to_string(&ServerFrame::Error("SESSION_CLOSED".to_string())).unwrap();
        assert_eq!(json, r#"{"error":"SESSION_CLOSED"}"#);
    }

    #[test]
    fn test_client_frames_parse() {
        let send: ClientFrame = serde_json::from_str(r#"{"content":"hello"}"#).unwrap();
        assert_eq!(send, ClientFrame::Send { content: "hello".to_string() });
        let ack: ClientFrame = serde_json::from_str(r#"{"ack":7}"#).unwrap();
        assert_eq!(ack, ClientFrame::Ack { ack: 7 });

        let id = Uuid::now_v7();
        let attach: AttachRequest =
            serde_json::from_str(&format!(r#"{{"session_id":"{id}"}}"#)).unwrap();
        assert_eq!(attach.last_seq, 0);
        assert_eq!(attach.mode, RequestedMode::Auto);
    }

    #[test]
    fn test_new_connection_state_disconnected() {
        let state = ConnectionState::new(Uuid::now_v7(), RequestedMode::Push);
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.terminal_failure);
        assert!(!state.phase.is_connected());
    }
}
