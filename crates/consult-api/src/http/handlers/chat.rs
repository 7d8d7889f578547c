//! Chat subsystem configuration and health handlers.
//!
//! Endpoints:
//! - GET /api/v1/chat/config - Negotiator settings clients should use
//! - GET /api/v1/chat/health - Counters, fallback rate and `healthy` flag

use std::time::Instant;

use axum::extract::State;
use axum::Json;
use consult_core::chat::repository::SessionStore;
use consult_types::health::HealthSnapshot;
use consult_types::transport::NegotiatorConfig;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/chat/config
pub async fn get_config(
    State(state): State<AppState>,
    _auth: Authenticated,
) -> Result<Json<ApiResponse<NegotiatorConfig>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let config = state.orchestrator.registry().config().clone();

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(config, request_id, elapsed).with_link("self", "/api/v1/chat/config"),
    ))
}

/// GET /api/v1/chat/health
///
/// Always answers; a failing store shows up as `healthy: false`.
pub async fn get_health(
    State(state): State<AppState>,
    _auth: Authenticated,
) -> Result<Json<ApiResponse<HealthSnapshot>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let orchestrator = &state.orchestrator;
    let active = match orchestrator.sessions().count_open().await {
        Ok(count) => count,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to count open sessions");
            orchestrator.health().record_storage_error();
            0
        }
    };
    let snapshot = orchestrator
        .health()
        .snapshot(active, &orchestrator.registry().mode_counts());

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(snapshot, request_id, elapsed).with_link("self", "/api/v1/chat/health"),
    ))
}
