//! Query parameter extractors for list endpoints.

use consult_types::chat::{Pagination, SessionFilter, SessionStatus};
use consult_types::transport::RequestedMode;
use serde::Deserialize;

/// Query parameters for the session list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct SessionListQuery {
    /// Filter by status (active, idle, closed).
    pub status: Option<SessionStatus>,
    /// Case-insensitive label substring.
    pub label: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl SessionListQuery {
    /// The owner filter is set by the orchestrator from the principal.
    pub fn into_filter(self) -> SessionFilter {
        SessionFilter {
            owner: None,
            status: self.status,
            label_contains: self.label.filter(|l| !l.trim().is_empty()),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Query parameters for the history endpoint.
///
/// With `since` this is a pull read (messages after `since`, and the
/// request counts as pull traffic); without it a plain history page.
#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    pub since: Option<u64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Mode the pulling client negotiated under. Defaults to `auto`.
    #[serde(default)]
    pub mode: RequestedMode,
}

/// Default number of messages per history read.
pub const DEFAULT_HISTORY_LIMIT: i64 = 100;

impl HistoryQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1_000)
    }

    pub fn page(&self) -> Pagination {
        Pagination {
            limit: self.limit(),
            offset: self.offset.unwrap_or(0).max(0),
        }
    }
}
