//! Token verification contract.
//!
//! Issuance is out of scope for the chat service; it only needs to turn a
//! presented token into a [`Principal`] or reject it.

use consult_types::error::AuthError;
use serde::Serialize;

/// An authenticated caller. Sessions are owned by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: String,
}

/// Verifies bearer tokens / API keys.
///
/// Implementations live in consult-infra (e.g., `SqliteTokenVerifier`).
pub trait TokenVerifier: Send + Sync {
    fn verify(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Principal, AuthError>> + Send;
}

/// Fixed token table for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: Vec<(String, String)>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: impl Into<String>) -> Self {
        self.tokens.push((token.into(), principal.into()));
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        self.tokens
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, p)| Principal { id: p.clone() })
            .ok_or(AuthError::Invalid)
    }
}
