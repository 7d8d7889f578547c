//! Transport negotiation and delivery.
//!
//! - `negotiator`: the pure connection state machine
//! - `registry`: per-session connection state and active adapters (server)
//! - `adapter`: push and pull delivery behind one trait
//! - `driver`: the negotiation loop with real timers (client)

pub mod adapter;
pub mod driver;
pub mod negotiator;
pub mod registry;
