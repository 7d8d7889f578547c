//! Inbound message handler for pull clients.
//!
//! Endpoint:
//! - POST /api/v1/sessions/{id}/messages - Send one message, receive the exchange
//!
//! The orchestrator processes the message on the session's queue, so a
//! client that disconnects mid-request still finds both messages in the
//! history afterwards.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::Json;
use consult_types::chat::ChatMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::handlers::session::parse_uuid;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for sending a message.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

/// The stored user message and the reply it produced.
#[derive(Debug, Serialize)]
pub struct ExchangeResponse {
    pub user: ChatMessage,
    pub assistant: ChatMessage,
}

/// POST /api/v1/sessions/{id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(session_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<ApiResponse<ExchangeResponse>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sid = parse_uuid(&session_id)?;
    let exchange = state
        .orchestrator
        .handle_inbound(sid, &principal.id, &request.content)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let next = exchange.assistant.sequence;
    let resp = ApiResponse::success(
        ExchangeResponse {
            user: exchange.user,
            assistant: exchange.assistant,
        },
        request_id,
        elapsed,
    )
    .with_link("session", &format!("/api/v1/sessions/{sid}"))
    .with_link("next", &format!("/api/v1/sessions/{sid}/history?since={next}"));

    Ok(Json(resp))
}
