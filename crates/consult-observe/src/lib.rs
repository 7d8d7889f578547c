//! Observability setup shared by the `consultd` binary.

pub mod tracing_setup;
