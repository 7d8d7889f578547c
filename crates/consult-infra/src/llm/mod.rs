//! Generation backend implementations.
//!
//! [`create_backend`] picks the Anthropic Messages API client when an API
//! key is available, and [`DisabledBackend`] otherwise, so a keyless service
//! still answers every message through the fallback table.

pub mod anthropic;

use secrecy::SecretString;
use tracing::warn;

use consult_core::llm::backend::GenerationBackend;
use consult_core::llm::box_backend::BoxGenerationBackend;
use consult_types::config::GenerationConfig;
use consult_types::llm::{GenerationError, GenerationRequest, GenerationResponse};

use self::anthropic::AnthropicBackend;

/// Build the configured backend.
pub fn create_backend(config: &GenerationConfig, api_key: Option<SecretString>) -> BoxGenerationBackend {
    match api_key {
        Some(key) => BoxGenerationBackend::new(
            AnthropicBackend::new(key).with_base_url(config.base_url.clone()),
        ),
        None => {
            warn!("No generation API key configured, every reply will use the fallback table");
            BoxGenerationBackend::new(DisabledBackend)
        }
    }
}

/// Backend that is never configured. Every call fails with `NotConfigured`.
pub struct DisabledBackend;

impl GenerationBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        Err(GenerationError::NotConfigured)
    }
}
