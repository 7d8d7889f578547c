//! GenerationBackend trait definition.

use consult_types::llm::{GenerationError, GenerationRequest, GenerationResponse};

/// Trait for text generation backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
/// Implementations live in consult-infra (e.g., `AnthropicBackend`).
pub trait GenerationBackend: Send + Sync {
    /// Human-readable backend name (e.g., "anthropic", "disabled").
    fn name(&self) -> &str;

    /// Send one request and wait for the complete response.
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl std::future::Future<Output = Result<GenerationResponse, GenerationError>> + Send;
}
