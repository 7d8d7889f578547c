//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use consult_types::error::{AuthError, ChatError, ValidationError};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Chat domain errors (validation, ownership, connectivity, storage).
    Chat(ChatError),
    /// Authentication failure.
    Auth(AuthError),
    /// Malformed request input (path, query, body).
    Validation(String),
}

impl From<ChatError> for AppError {
    fn from(e: ChatError) -> Self {
        AppError::Chat(e)
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::Chat(ChatError::Validation(e))
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        AppError::Auth(e)
    }
}

impl AppError {
    /// Status, machine-readable code and message for this error.
    pub fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Chat(ChatError::Validation(v)) => validation_parts(v),
            // Another principal's session is reported as missing.
            AppError::Chat(ChatError::Forbidden(id)) => (
                StatusCode::NOT_FOUND,
                "SESSION_NOT_FOUND",
                format!("Session {id} not found"),
            ),
            AppError::Chat(e @ ChatError::Connectivity { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "CONNECTIVITY_FAILED", e.to_string())
            }
            AppError::Chat(ChatError::Storage(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "Storage is temporarily unavailable".to_string(),
            ),
            AppError::Auth(AuthError::Unavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "Credential store is temporarily unavailable".to_string(),
            ),
            AppError::Auth(e) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", auth_message(e)),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }

    /// Machine-readable code, also used for WebSocket `{"error": code}` frames.
    pub fn code(&self) -> &'static str {
        self.parts().1
    }
}

fn validation_parts(e: &ValidationError) -> (StatusCode, &'static str, String) {
    let (status, code) = match e {
        ValidationError::EmptyContent => (StatusCode::BAD_REQUEST, "EMPTY_CONTENT"),
        ValidationError::ContentTooLong { .. } => (StatusCode::BAD_REQUEST, "CONTENT_TOO_LONG"),
        ValidationError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        ValidationError::SessionClosed(_) => (StatusCode::CONFLICT, "SESSION_CLOSED"),
        ValidationError::Invalid(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
    };
    (status, code, e.to_string())
}

fn auth_message(e: &AuthError) -> String {
    match e {
        AuthError::Missing => "Missing API key. Provide via 'Authorization: Bearer <key>' or 'X-API-Key: <key>' header.".to_string(),
        other => other.to_string(),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
