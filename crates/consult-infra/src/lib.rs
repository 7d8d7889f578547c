//! Infrastructure layer for the consultant chat service.
//!
//! Contains implementations of the traits defined in `consult-core`:
//! SQLite session and message storage, API key verification, the HTTP
//! generation backend, and the `config.toml` loader.

pub mod config;
pub mod llm;
pub mod sqlite;
