//! Shared domain types for the consultant chat service.
//!
//! This crate contains the core domain types used across the workspace:
//! chat sessions and messages, transport negotiation state, generation
//! requests, health snapshots, configuration, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod chat;
pub mod config;
pub mod error;
pub mod health;
pub mod llm;
pub mod transport;
