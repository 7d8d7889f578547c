//! In-memory SessionStore and MessageLog.
//!
//! Used by unit tests across the workspace.
//! `set_available(false)` makes every call fail with
//! `RepositoryError::Connection` to simulate an unreachable store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use consult_types::chat::{
    ChatMessage, ChatSession, MessageRole, Pagination, SessionFilter, SessionStatus,
    SessionUpdate,
};
use consult_types::error::RepositoryError;
use consult_types::transport::TransportMode;
use uuid::Uuid;

use super::repository::{MessageLog, SessionStore};

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Query("lock poisoned".to_string())
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<Uuid, ChatSession>>,
    unavailable: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut HashMap<Uuid, ChatSession>) -> Result<R, RepositoryError>,
    ) -> Result<R, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        f(&mut sessions)
    }
}

fn close(session: &mut ChatSession, now: DateTime<Utc>) -> bool {
    if session.is_closed() {
        return false;
    }
    session.status = SessionStatus::Closed;
    session.closed_at = Some(now);
    true
}

impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session: &ChatSession) -> Result<ChatSession, RepositoryError> {
        self.with(|sessions| {
            if sessions.contains_key(&session.id) {
                return Err(RepositoryError::Conflict(format!(
                    "session {} already exists",
                    session.id
                )));
            }
            sessions.insert(session.id, session.clone());
            Ok(session.clone())
        })
    }

    async fn get_session(&self, session_id: &Uuid) -> Result<Option<ChatSession>, RepositoryError> {
        self.with(|sessions| Ok(sessions.get(session_id).cloned()))
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<ChatSession>, RepositoryError> {
        self.with(|sessions| {
            let needle = filter.label_contains.as_ref().map(|l| l.to_lowercase());
            let mut matched: Vec<ChatSession> = sessions
                .values()
                .filter(|s| filter.owner.as_ref().is_none_or(|o| &s.owner == o))
                .filter(|s| filter.status.is_none_or(|st| s.status == st))
                .filter(|s| {
                    needle
                        .as_ref()
                        .is_none_or(|n| s.context.label.to_lowercase().contains(n.as_str()))
                })
                .cloned()
                .collect();
            matched.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));

            let offset = filter.offset.unwrap_or(0).max(0) as usize;
            let limit = filter.limit.unwrap_or(100).max(0) as usize;
            Ok(matched.into_iter().skip(offset).take(limit).collect())
        })
    }

    async fn update_session(
        &self,
        session_id: &Uuid,
        update: &SessionUpdate,
    ) -> Result<ChatSession, RepositoryError> {
        self.with(|sessions| {
            let session = sessions.get_mut(session_id).ok_or(RepositoryError::NotFound)?;
            if let Some(status) = update.status {
                match status {
                    SessionStatus::Closed => {
                        close(session, Utc::now());
                    }
                    _ if session.is_closed() => {
                        return Err(RepositoryError::Conflict(format!(
                            "session {session_id} is closed"
                        )));
                    }
                    other => session.status = other,
                }
            }
            if let Some(label) = &update.label {
                session.context.label = label.clone();
            }
            if let Some(priority) = update.priority {
                session.context.priority = Some(priority);
            }
            Ok(session.clone())
        })
    }

    async fn touch(&self, session_id: &Uuid) -> Result<(), RepositoryError> {
        self.with(|sessions| {
            let session = sessions.get_mut(session_id).ok_or(RepositoryError::NotFound)?;
            if !session.is_closed() {
                session.status = SessionStatus::Active;
                session.last_activity_at = Utc::now();
            }
            Ok(())
        })
    }

    async fn set_transport_mode(
        &self,
        session_id: &Uuid,
        mode: Option<TransportMode>,
    ) -> Result<(), RepositoryError> {
        self.with(|sessions| {
            let session = sessions.get_mut(session_id).ok_or(RepositoryError::NotFound)?;
            session.transport_mode = mode;
            Ok(())
        })
    }

    async fn close_session(&self, session_id: &Uuid) -> Result<bool, RepositoryError> {
        self.with(|sessions| {
            let session = sessions.get_mut(session_id).ok_or(RepositoryError::NotFound)?;
            Ok(close(session, Utc::now()))
        })
    }

    async fn mark_idle_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.with(|sessions| {
            let mut marked = 0;
            for session in sessions.values_mut() {
                if session.status == SessionStatus::Active && session.last_activity_at < cutoff {
                    session.status = SessionStatus::Idle;
                    marked += 1;
                }
            }
            Ok(marked)
        })
    }

    async fn close_idle_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        self.with(|sessions| {
            let now = Utc::now();
            Ok(sessions
                .values_mut()
                .filter(|s| s.last_activity_at < cutoff)
                .filter_map(|s| close(s, now).then_some(s.id))
                .collect())
        })
    }

    async fn count_open(&self) -> Result<u64, RepositoryError> {
        self.with(|sessions| Ok(sessions.values().filter(|s| !s.is_closed()).count() as u64))
    }
}

#[derive(Default)]
pub struct InMemoryMessageLog {
    messages: Mutex<HashMap<Uuid, Vec<ChatMessage>>>,
    unavailable: AtomicBool,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut HashMap<Uuid, Vec<ChatMessage>>) -> R,
    ) -> Result<R, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        let mut messages = self.messages.lock().map_err(poisoned)?;
        Ok(f(&mut messages))
    }
}

impl MessageLog for InMemoryMessageLog {
    async fn append(
        &self,
        session_id: &Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<ChatMessage, RepositoryError> {
        self.with(|messages| {
            let log = messages.entry(*session_id).or_default();
            let message = ChatMessage {
                id: Uuid::now_v7(),
                session_id: *session_id,
                role,
                content: content.to_string(),
                sequence: log.len() as u64 + 1,
                created_at: Utc::now(),
            };
            log.push(message.clone());
            message
        })
    }

    async fn list_since(
        &self,
        session_id: &Uuid,
        after: u64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.with(|messages| {
            messages
                .get(session_id)
                .map(|log| {
                    log.iter()
                        .filter(|m| m.sequence > after)
                        .take(limit.max(0) as usize)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn list_all(
        &self,
        session_id: &Uuid,
        page: Pagination,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.with(|messages| {
            messages
                .get(session_id)
                .map(|log| {
                    log.iter()
                        .skip(page.offset.max(0) as usize)
                        .take(page.limit.max(0) as usize)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn recent(&self, session_id: &Uuid, n: usize) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.with(|messages| {
            messages
                .get(session_id)
                .map(|log| log[log.len().saturating_sub(n)..].to_vec())
                .unwrap_or_default()
        })
    }

    async fn latest_sequence(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        self.with(|messages| {
            messages
                .get(session_id)
                .and_then(|log| log.last())
                .map(|m| m.sequence)
                .unwrap_or(0)
        })
    }
}
