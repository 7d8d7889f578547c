//! SessionStore and MessageLog trait definitions.
//!
//! Both follow the RPITIT pattern: native async fn in traits, implemented
//! by `consult-infra` (SQLite) and by the in-memory stores in
//! [`super::memory`].

use chrono::{DateTime, Utc};
use consult_types::chat::{
    ChatMessage, ChatSession, MessageRole, Pagination, SessionFilter, SessionUpdate,
};
use consult_types::error::RepositoryError;
use consult_types::transport::TransportMode;
use uuid::Uuid;

/// Persistence for chat sessions.
///
/// The store is the only owner of session records; everything else refers
/// to a session by id.
pub trait SessionStore: Send + Sync {
    /// Insert a freshly built session.
    fn create_session(
        &self,
        session: &ChatSession,
    ) -> impl std::future::Future<Output = Result<ChatSession, RepositoryError>> + Send;

    fn get_session(
        &self,
        session_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ChatSession>, RepositoryError>> + Send;

    /// List sessions matching `filter`, most recently active first.
    fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ChatSession>, RepositoryError>> + Send;

    /// Apply label/priority/status changes. Returns `NotFound` for unknown ids.
    ///
    /// A `closed` status goes through [`close_session`](Self::close_session)
    /// semantics: `closed_at` is stamped once.
    fn update_session(
        &self,
        session_id: &Uuid,
        update: &SessionUpdate,
    ) -> impl std::future::Future<Output = Result<ChatSession, RepositoryError>> + Send;

    /// Bump `last_activity_at` and reactivate an idle session.
    ///
    /// Closed sessions are left untouched.
    fn touch(
        &self,
        session_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn set_transport_mode(
        &self,
        session_id: &Uuid,
        mode: Option<TransportMode>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Close a session. Idempotent: returns `true` only for the call that
    /// actually closed it, `NotFound` if the session never existed.
    fn close_session(
        &self,
        session_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark active sessions with no activity since `cutoff` as idle.
    fn mark_idle_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Close non-closed sessions with no activity since `cutoff`.
    /// Returns the ids that were closed.
    fn close_idle_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Count sessions that are not closed.
    fn count_open(&self) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}

/// Append-only per-session message log.
///
/// Messages are never updated or deleted.
pub trait MessageLog: Send + Sync {
    /// Append a message with the next sequence number for the session.
    ///
    /// Concurrent appends to one session never produce duplicate or
    /// skipped sequence numbers.
    fn append(
        &self,
        session_id: &Uuid,
        role: MessageRole,
        content: &str,
    ) -> impl std::future::Future<Output = Result<ChatMessage, RepositoryError>> + Send;

    /// Messages with `sequence > after`, ascending, at most `limit`.
    fn list_since(
        &self,
        session_id: &Uuid,
        after: u64,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    /// Full history page, ascending by sequence.
    fn list_all(
        &self,
        session_id: &Uuid,
        page: Pagination,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    /// The last `n` messages, ascending by sequence.
    fn recent(
        &self,
        session_id: &Uuid,
        n: usize,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    /// Highest sequence in the session, 0 when empty.
    fn latest_sequence(
        &self,
        session_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
