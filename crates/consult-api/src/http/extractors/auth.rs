//! API key authentication extractor.
//!
//! Extracts the presented key from:
//! - `Authorization: Bearer <key>` header
//! - `X-API-Key: <key>` header
//! - `?token=<key>` query parameter, on WebSocket upgrade requests only
//!
//! and resolves it to a [`Principal`] through the state's [`TokenVerifier`].

use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, UPGRADE};
use axum::http::request::Parts;
use consult_core::auth::{Principal, TokenVerifier};
use consult_types::error::AuthError;

use crate::http::error::AppError;
use crate::state::AppState;

/// The authenticated caller. Extracting this validates the API key.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Principal);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = extract_api_key(parts)?;
        let principal = state.verifier.verify(&key).await.map_err(|e| {
            if let AuthError::Unavailable(reason) = &e {
                tracing::warn!(%reason, "Token verification unavailable");
                state.orchestrator.health().record_storage_error();
            }
            AppError::Auth(e)
        })?;
        Ok(Authenticated(principal))
    }
}

/// Extract the API key from request headers (or the query on upgrades).
fn extract_api_key(parts: &Parts) -> Result<String, AppError> {
    if let Some(auth) = parts.headers.get(AUTHORIZATION) {
        let auth_str = auth.to_str().map_err(|_| AppError::Auth(AuthError::Invalid))?;
        if let Some(key) = auth_str.strip_prefix("Bearer ") {
            return Ok(key.trim().to_string());
        }
    }

    if let Some(key) = parts.headers.get("x-api-key") {
        let key_str = key.to_str().map_err(|_| AppError::Auth(AuthError::Invalid))?;
        return Ok(key_str.trim().to_string());
    }

    // Browsers cannot set headers on a WebSocket handshake.
    if is_websocket_upgrade(parts) {
        if let Some(token) = query_token(parts.uri.query()) {
            return Ok(token);
        }
    }

    Err(AppError::Auth(AuthError::Missing))
}

fn is_websocket_upgrade(parts: &Parts) -> bool {
    parts
        .headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
