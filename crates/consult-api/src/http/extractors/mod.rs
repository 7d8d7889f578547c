//! Custom Axum extractors.

pub mod auth;
pub mod query;
