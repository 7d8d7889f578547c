//! Global configuration loader.
//!
//! Reads `config.toml` into [`GlobalConfig`], falling back to defaults when
//! the file is missing or malformed, then applies `CONSULT_*` environment
//! overrides on top.

use std::path::Path;

use consult_types::config::GlobalConfig;
use secrecy::SecretString;

/// Environment variable holding the generation backend API key.
pub const GENERATION_API_KEY_ENV: &str = "CONSULT_GENERATION_API_KEY";

/// Load configuration from `config_path`.
///
/// - Missing file: [`GlobalConfig::default()`].
/// - Unreadable or unparsable file: warning, then defaults.
pub async fn load_global_config(config_path: &Path) -> GlobalConfig {
    let content = match tokio::fs::read_to_string(config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// [`load_global_config`] followed by process environment overrides.
pub async fn load_config_with_env(config_path: &Path) -> GlobalConfig {
    let mut config = load_global_config(config_path).await;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Apply `CONSULT_*` overrides read through `lookup`.
///
/// Values that fail to parse are ignored with a warning.
pub fn apply_env_overrides(config: &mut GlobalConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring invalid environment override");
                None
            }
        }
    }

    let chat = &mut config.chat.negotiator;
    if let Some(mode) = parsed(&lookup, "CONSULT_CHAT_MODE") {
        chat.mode = mode;
    }
    if let Some(ms) = parsed(&lookup, "CONSULT_PUSH_ATTACH_TIMEOUT_MS") {
        chat.push_attach_timeout_ms = ms;
    }
    if let Some(ms) = parsed(&lookup, "CONSULT_POLL_INTERVAL_MS") {
        chat.poll_interval_ms = ms;
    }
    if let Some(n) = parsed(&lookup, "CONSULT_MAX_RECONNECT_ATTEMPTS") {
        chat.max_reconnect_attempts = n;
    }
    if let Some(ms) = parsed(&lookup, "CONSULT_FALLBACK_DELAY_MS") {
        chat.fallback_delay_ms = ms;
    }
    if let Some(ms) = parsed(&lookup, "CONSULT_GENERATION_TIMEOUT_MS") {
        config.generation.timeout_ms = ms;
    }
    if let Some(url) = lookup("CONSULT_GENERATION_URL").filter(|u| !u.trim().is_empty()) {
        config.generation.base_url = url.trim().to_string();
    }
    if let Some(url) = lookup("CONSULT_DATABASE_URL").filter(|u| !u.trim().is_empty()) {
        config.server.database_url = Some(url.trim().to_string());
    }
}

/// The generation API key from the environment, if set and non-empty.
pub fn generation_api_key() -> Option<SecretString> {
    std::env::var(GENERATION_API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .map(SecretString::from)
}
