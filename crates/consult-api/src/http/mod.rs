//! HTTP/WebSocket API for the consultant chat service.
//!
//! Axum-based REST API at `/api/v1/` with API key authentication,
//! envelope response format, CORS support, and the push channel at
//! `/api/v1/ws/chat`.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
