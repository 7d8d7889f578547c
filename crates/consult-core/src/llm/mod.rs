//! Response generation.
//!
//! - `GenerationBackend`: RPITIT trait for concrete backends
//! - `BoxGenerationBackend`: object-safe wrapper for dynamic dispatch
//! - `ResponseSynthesizer`: history window, prompt framing, timeout and the
//!   keyword fallback path

pub mod backend;
pub mod box_backend;
pub mod fallback;
pub mod synthesizer;
