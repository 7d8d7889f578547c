//! Business logic and repository trait definitions for the consultant chat service.
//!
//! This crate defines the "ports" (repository, token verifier and generation
//! backend traits) that the infrastructure layer implements. It depends only
//! on `consult-types` -- never on `consult-infra` or any database/IO crate.

pub mod auth;
pub mod chat;
pub mod health;
pub mod llm;
pub mod transport;
