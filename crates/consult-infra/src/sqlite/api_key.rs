//! API key issuance and verification against the `api_keys` table.
//!
//! Only the SHA-256 hash of a key is stored; the plaintext is returned once
//! by [`create_api_key`] and never persisted.

use chrono::{DateTime, Duration, Utc};
use consult_core::auth::{Principal, TokenVerifier};
use consult_types::error::AuthError;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

const KEY_PREFIX: &str = "cnslt_";

/// Compute SHA-256 hash of an API key (lowercase hex).
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)
}

/// A freshly issued key. `key` is the only copy of the plaintext.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub id: Uuid,
    pub key: String,
    pub principal: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Generate a random key for `principal` and store its hash.
pub async fn create_api_key(
    pool: &DatabasePool,
    principal: &str,
    ttl: Option<Duration>,
) -> Result<IssuedKey, sqlx::Error> {
    let mut key_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut key_bytes);
    let key = format!(
        "{KEY_PREFIX}{}",
        key_bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
    );

    let id = Uuid::now_v7();
    let now = Utc::now();
    let expires_at = ttl.map(|ttl| now + ttl);

    sqlx::query(
        "INSERT INTO api_keys (id, key_hash, principal, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(hash_api_key(&key))
    .bind(principal)
    .bind(now.to_rfc3339())
    .bind(expires_at.map(|t| t.to_rfc3339()))
    .execute(&pool.writer)
    .await?;

    Ok(IssuedKey {
        id,
        key,
        principal: principal.to_string(),
        expires_at,
    })
}

/// Verifies presented keys by hash lookup.
#[derive(Clone)]
pub struct SqliteTokenVerifier {
    pool: DatabasePool,
}

impl SqliteTokenVerifier {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl TokenVerifier for SqliteTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let row = sqlx::query("SELECT id, principal, expires_at FROM api_keys WHERE key_hash = ?")
            .bind(hash_api_key(token))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?
            .ok_or(AuthError::Invalid)?;

        let id: String = row.get("id");
        let principal: String = row.get("principal");
        let expires_at: Option<String> = row.get("expires_at");

        if let Some(expires_at) = expires_at {
            let expires_at = DateTime::parse_from_rfc3339(&expires_at)
                .map_err(|e| AuthError::Unavailable(format!("invalid expires_at: {e}")))?
                .with_timezone(&Utc);
            if expires_at <= Utc::now() {
                return Err(AuthError::Expired);
            }
        }

        // Update last_used_at (best effort, don't fail the request)
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&id)
            .execute(&self.pool.writer)
            .await;

        Ok(Principal { id: principal })
    }
}
