//! BoxGenerationBackend -- object-safe dynamic dispatch wrapper.
//!
//! 1. `GenerationBackendDyn` is an object-safe trait with boxed futures
//! 2. It is blanket-implemented for all `T: GenerationBackend`
//! 3. `BoxGenerationBackend` wraps `Box<dyn GenerationBackendDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use consult_types::llm::{GenerationError, GenerationRequest, GenerationResponse};

use super::backend::GenerationBackend;

/// Object-safe version of [`GenerationBackend`].
pub trait GenerationBackendDyn: Send + Sync {
    fn name(&self) -> &str;

    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationResponse, GenerationError>> + Send + 'a>>;
}

impl<T: GenerationBackend> GenerationBackendDyn for T {
    fn name(&self) -> &str {
        GenerationBackend::name(self)
    }

    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationResponse, GenerationError>> + Send + 'a>> {
        Box::pin(self.generate(request))
    }
}

/// Type-erased generation backend chosen at startup (real or disabled).
pub struct BoxGenerationBackend {
    inner: Box<dyn GenerationBackendDyn + Send + Sync>,
}

impl BoxGenerationBackend {
    pub fn new<T: GenerationBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        self.inner.generate_boxed(request).await
    }
}
