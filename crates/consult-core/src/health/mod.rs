//! Chat subsystem health counters.

pub mod monitor;
