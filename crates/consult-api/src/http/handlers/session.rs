//! Session lifecycle and history HTTP handlers.
//!
//! Endpoints:
//! - POST   /api/v1/sessions              - Open a session
//! - GET    /api/v1/sessions              - List the caller's sessions
//! - GET    /api/v1/sessions/{id}         - Get a session
//! - PUT    /api/v1/sessions/{id}         - Update label, priority or status
//! - DELETE /api/v1/sessions/{id}         - Close a session (idempotent)
//! - GET    /api/v1/sessions/{id}/history - Pull read (`?since=`) or history page

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use consult_types::chat::{ChatMessage, ChatSession, SessionContext, SessionUpdate};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::extractors::query::{HistoryQuery, SessionListQuery};
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Parse a UUID from a path parameter, returning a 400 error on invalid format.
pub fn parse_uuid(s: &str) -> Result<Uuid, AppError> {
    s.parse::<Uuid>()
        .map_err(|_| AppError::Validation(format!("Invalid UUID: {s}")))
}

fn session_response(session: ChatSession, request_id: String, elapsed: u64) -> ApiResponse<ChatSession> {
    let id = session.id;
    ApiResponse::success(session, request_id, elapsed)
        .with_link("self", &format!("/api/v1/sessions/{id}"))
        .with_link("history", &format!("/api/v1/sessions/{id}/history"))
        .with_link("messages", &format!("/api/v1/sessions/{id}/messages"))
}

/// POST /api/v1/sessions - Open a session owned by the caller.
pub async fn create_session(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Json(context): Json<SessionContext>,
) -> Result<(StatusCode, Json<ApiResponse<ChatSession>>), AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let session = state
        .orchestrator
        .create_session(&principal.id, context)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok((
        StatusCode::CREATED,
        Json(session_response(session, request_id, elapsed)),
    ))
}

/// GET /api/v1/sessions - List the caller's sessions, most recent first.
pub async fn list_sessions(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<ApiResponse<Vec<ChatSession>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sessions = state
        .orchestrator
        .list_sessions(&principal.id, query.into_filter())
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(sessions, request_id, elapsed)
        .with_link("self", "/api/v1/sessions");

    Ok(Json(resp))
}

/// GET /api/v1/sessions/{id} - Get a session by ID.
pub async fn get_session(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<ChatSession>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sid = parse_uuid(&session_id)?;
    let session = state.orchestrator.authorize(sid, &principal.id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(session_response(session, request_id, elapsed)))
}

/// PUT /api/v1/sessions/{id} - Update label, priority or status.
pub async fn update_session(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(session_id): Path<String>,
    Json(update): Json<SessionUpdate>,
) -> Result<Json<ApiResponse<ChatSession>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sid = parse_uuid(&session_id)?;
    let session = state
        .orchestrator
        .update_session(sid, &principal.id, update)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(session_response(session, request_id, elapsed)))
}

/// DELETE /api/v1/sessions/{id} - Close a session. Closing twice succeeds.
pub async fn close_session(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<ChatSession>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sid = parse_uuid(&session_id)?;
    let session = state.orchestrator.close_session(sid, &principal.id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(session_response(session, request_id, elapsed)))
}

/// GET /api/v1/sessions/{id}/history - Messages in sequence order.
///
/// `?since=N` returns messages after `N` and registers the caller as a pull
/// client; an empty result is normal. Without `since`, `limit`/`offset`
/// page through the full history.
pub async fn get_history(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<ChatMessage>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sid = parse_uuid(&session_id)?;
    let messages = match query.since {
        Some(after) => {
            state
                .orchestrator
                .pull_since(sid, &principal.id, query.mode, after, query.limit())
                .await?
        }
        None => {
            state
                .orchestrator
                .history_page(sid, &principal.id, query.page())
                .await?
        }
    };

    let elapsed = start.elapsed().as_millis() as u64;
    let mut resp = ApiResponse::success(messages, request_id, elapsed)
        .with_link("self", &format!("/api/v1/sessions/{sid}/history"))
        .with_link("session", &format!("/api/v1/sessions/{sid}"));
    if let Some(last_seq) = resp.data.as_ref().and_then(|m| m.last()).map(|m| m.sequence) {
        resp = resp.with_link(
            "next",
            &format!("/api/v1/sessions/{sid}/history?since={}", last_seq),
        );
    }

    Ok(Json(resp))
}
