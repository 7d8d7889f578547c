//! SQLite session store and message log.
//!
//! Implements `SessionStore` and `MessageLog` from `consult-core` using sqlx
//! with split read/write pools: raw queries, private Row structs, writes on
//! the single-connection writer.

use chrono::{DateTime, SecondsFormat, Utc};
use consult_core::chat::repository::{MessageLog, SessionStore};
use consult_types::chat::{
    ChatMessage, ChatSession, MessageRole, Pagination, Priority, SessionContext, SessionFilter,
    SessionStatus, SessionUpdate,
};
use consult_types::error::RepositoryError;
use consult_types::transport::TransportMode;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SessionStore`.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DatabasePool,
}

impl SqliteSessionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn exists(&self, session_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM chat_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(row.is_some())
    }
}

/// SQLite-backed implementation of `MessageLog`.
#[derive(Clone)]
pub struct SqliteMessageLog {
    pool: DatabasePool,
}

impl SqliteMessageLog {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ChatSessionRow {
    id: String,
    owner: String,
    label: String,
    priority: Option<String>,
    status: String,
    transport_mode: Option<String>,
    created_at: String,
    last_activity_at: String,
    closed_at: Option<String>,
}

impl ChatSessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            label: row.try_get("label")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            transport_mode: row.try_get("transport_mode")?,
            created_at: row.try_get("created_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }

    fn into_session(self) -> Result<ChatSession, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Query(format!("invalid session id: {e}")))?;
        let priority: Option<Priority> = self
            .priority
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(RepositoryError::Query)?;
        let status: SessionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let transport_mode: Option<TransportMode> = self
            .transport_mode
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(RepositoryError::Query)?;

        Ok(ChatSession {
            id,
            owner: self.owner,
            context: SessionContext {
                label: self.label,
                priority,
            },
            status,
            transport_mode,
            created_at: parse_datetime(&self.created_at)?,
            last_activity_at: parse_datetime(&self.last_activity_at)?,
            closed_at: self.closed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct ChatMessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    sequence: i64,
    created_at: String,
}

impl ChatMessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            sequence: row.try_get("sequence")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_message(self) -> Result<ChatMessage, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Query(format!("invalid message id: {e}")))?;
        let session_id = Uuid::parse_str(&self.session_id)
            .map_err(|e| RepositoryError::Query(format!("invalid session_id: {e}")))?;
        let role: MessageRole = self.role.parse().map_err(RepositoryError::Query)?;

        Ok(ChatMessage {
            id,
            session_id,
            role,
            content: self.content,
            sequence: self.sequence as u64,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn map_sessions(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<ChatSession>, RepositoryError> {
    let mut sessions = Vec::with_capacity(rows.len());
    for row in rows {
        let session_row =
            ChatSessionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        sessions.push(session_row.into_session()?);
    }
    Ok(sessions)
}

fn map_messages(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<ChatMessage>, RepositoryError> {
    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let msg_row =
            ChatMessageRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        messages.push(msg_row.into_message()?);
    }
    Ok(messages)
}

// ---------------------------------------------------------------------------
// SessionStore implementation
// ---------------------------------------------------------------------------

impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: &ChatSession) -> Result<ChatSession, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO chat_sessions (id, owner, label, priority, status, transport_mode, created_at, last_activity_at, closed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session.id.to_string())
        .bind(&session.owner)
        .bind(&session.context.label)
        .bind(session.context.priority.map(|p| p.to_string()))
        .bind(session.status.to_string())
        .bind(session.transport_mode.map(|m| m.to_string()))
        .bind(format_datetime(&session.created_at))
        .bind(format_datetime(&session.last_activity_at))
        .bind(session.closed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("session {} already exists", session.id))
            }
            other => RepositoryError::Query(other.to_string()),
        })?;

        Ok(session.clone())
    }

    async fn get_session(&self, session_id: &Uuid) -> Result<Option<ChatSession>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let session_row = ChatSessionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(session_row.into_session()?))
            }
            None => Ok(None),
        }
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<ChatSession>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM chat_sessions WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(owner) = &filter.owner {
            sql.push_str(" AND owner = ?");
            binds.push(owner.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.to_string());
        }
        if let Some(needle) = &filter.label_contains {
            sql.push_str(" AND instr(lower(label), ?) > 0");
            binds.push(needle.to_lowercase());
        }

        let limit = filter.limit.unwrap_or(100).max(0);
        let offset = filter.offset.unwrap_or(0).max(0);
        sql.push_str(&format!(
            " ORDER BY last_activity_at DESC LIMIT {limit} OFFSET {offset}"
        ));

        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_sessions(&rows)
    }

    async fn update_session(
        &self,
        session_id: &Uuid,
        update: &SessionUpdate,
    ) -> Result<ChatSession, RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;
        let mut session = ChatSessionRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_session()?;

        if let Some(status) = update.status {
            match status {
                SessionStatus::Closed => {
                    if !session.is_closed() {
                        session.status = SessionStatus::Closed;
                        session.closed_at = Some(Utc::now());
                    }
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

        sqlx::query(
            r#"UPDATE chat_sessions
               SET label = ?, priority = ?, status = ?, closed_at = ?
               WHERE id = ?"#,
        )
        .bind(&session.context.label)
        .bind(session.context.priority.map(|p| p.to_string()))
        .bind(session.status.to_string())
        .bind(session.closed_at.as_ref().map(format_datetime))
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(session)
    }

    async fn touch(&self, session_id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE chat_sessions
               SET status = 'active', last_activity_at = ?
               WHERE id = ? AND status != 'closed'"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(session_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 && !self.exists(session_id).await? {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_transport_mode(
        &self,
        session_id: &Uuid,
        mode: Option<TransportMode>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE chat_sessions SET transport_mode = ? WHERE id = ?")
            .bind(mode.map(|m| m.to_string()))
            .bind(session_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn close_session(&self, session_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE chat_sessions
               SET status = 'closed', closed_at = ?
               WHERE id = ? AND status != 'closed'"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(session_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(session_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn mark_idle_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET status = 'idle' WHERE status = 'active' AND last_activity_at < ?",
        )
        .bind(format_datetime(&cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn close_idle_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            r#"UPDATE chat_sessions
               SET status = 'closed', closed_at = ?
               WHERE status != 'closed' AND last_activity_at < ?
               RETURNING id"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(format_datetime(&cutoff))
        .fetch_all(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Uuid::parse_str(&id)
                    .map_err(|e| RepositoryError::Query(format!("invalid session id: {e}")))
            })
            .collect()
    }

    async fn count_open(&self) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM chat_sessions WHERE status != 'closed'")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// MessageLog implementation
// ---------------------------------------------------------------------------

impl MessageLog for SqliteMessageLog {
    async fn append(
        &self,
        session_id: &Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<ChatMessage, RepositoryError> {
        let id = Uuid::now_v7();
        let created_at = Utc::now();

        // Next sequence is computed inside the INSERT on the single writer.
        let row = sqlx::query(
            r#"INSERT INTO chat_messages (id, session_id, role, content, sequence, created_at)
               SELECT ?, ?, ?, ?, COALESCE(MAX(sequence), 0) + 1, ?
               FROM chat_messages WHERE session_id = ?
               RETURNING sequence"#,
        )
        .bind(id.to_string())
        .bind(session_id.to_string())
        .bind(role.to_string())
        .bind(content)
        .bind(format_datetime(&created_at))
        .bind(session_id.to_string())
        .fetch_one(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("sequence collision in session {session_id}"))
            }
            other => RepositoryError::Query(other.to_string()),
        })?;

        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(ChatMessage {
            id,
            session_id: *session_id,
            role,
            content: content.to_string(),
            sequence: sequence as u64,
            created_at,
        })
    }

    async fn list_since(
        &self,
        session_id: &Uuid,
        after: u64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM chat_messages
               WHERE session_id = ? AND sequence > ?
               ORDER BY sequence ASC LIMIT ?"#,
        )
        .bind(session_id.to_string())
        .bind(i64::try_from(after).unwrap_or(i64::MAX))
        .bind(limit.max(0))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_messages(&rows)
    }

    async fn list_all(
        &self,
        session_id: &Uuid,
        page: Pagination,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM chat_messages
               WHERE session_id = ?
               ORDER BY sequence ASC LIMIT ? OFFSET ?"#,
        )
        .bind(session_id.to_string())
        .bind(page.limit.max(0))
        .bind(page.offset.max(0))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_messages(&rows)
    }

    async fn recent(&self, session_id: &Uuid, n: usize) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM (
                   SELECT * FROM chat_messages
                   WHERE session_id = ?
                   ORDER BY sequence DESC LIMIT ?
               ) ORDER BY sequence ASC"#,
        )
        .bind(session_id.to_string())
        .bind(n as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_messages(&rows)
    }

    async fn latest_sequence(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) AS seq FROM chat_messages WHERE session_id = ?",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let seq: i64 = row
            .try_get("seq")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(seq as u64)
    }
}
