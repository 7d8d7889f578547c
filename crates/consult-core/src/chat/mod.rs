//! Chat sessions, the append-only message log, and the orchestrator that
//! ties them to response generation and transport delivery.

pub mod memory;
pub mod orchestrator;
pub mod reaper;
pub mod repository;
