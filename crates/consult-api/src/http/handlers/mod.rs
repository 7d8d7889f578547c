//! HTTP request handlers organized by resource.

pub mod chat;
pub mod message;
pub mod session;
pub mod ws;
