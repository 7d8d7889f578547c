//! Global configuration types.
//!
//! `GlobalConfig` represents the top-level `config.toml`. Every field has a
//! default so an empty or missing file yields a runnable service.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::NegotiatorConfig;

/// Top-level configuration for the chat service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub sessions: SessionPolicy,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite URL. `None` resolves to `{data_dir}/consult.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8340
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_url: None,
        }
    }
}

/// Transport negotiation plus server-side cancellation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(flatten)]
    pub negotiator: NegotiatorConfig,
    /// How long an in-flight generation survives a disconnect or close.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

impl ChatConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            negotiator: NegotiatorConfig::default(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of most recent messages sent as history.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    1_024
}

fn default_temperature() -> f64 {
    0.4
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_history_window() -> usize {
    20
}

fn default_max_message_chars() -> usize {
    8_000
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_ms: default_timeout_ms(),
            history_window: default_history_window(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

/// Inactivity policy applied by the background session sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicy {
    #[serde(default = "default_idle_after_secs")]
    pub idle_after_secs: u64,
    #[serde(default = "default_close_after_secs")]
    pub close_after_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_idle_after_secs() -> u64 {
    15 * 60
}

fn default_close_after_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_after_secs: default_idle_after_secs(),
            close_after_secs: default_close_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Fallback rate at or above which the subsystem reports unhealthy.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
}

fn default_window_secs() -> u64 {
    300
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            failure_rate_threshold: default_failure_rate_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RequestedMode;

    #[test]
    fn test_global_config_deserialize_with_defaults() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8340);
        assert_eq!(config.chat.negotiator.mode, RequestedMode::Auto);
        assert_eq!(config.chat.negotiator.max_reconnect_attempts, 3);
        assert_eq!(config.generation.history_window, 20);
        assert_eq!(config.sessions.idle_after_secs, 900);
        assert!((config.health.failure_rate_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_global_config_deserialize_with_values() {
        let toml_str = r#"
[server]
port = 9000

[chat]
mode = "push"
push_attach_timeout_ms = 250
max_reconnect_attempts = 5
cancel_grace_ms = 100

[generation]
model = "claude-haiku"
timeout_ms = 3000
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.chat.negotiator.mode, RequestedMode::Push);
        assert_eq!(config.chat.negotiator.push_attach_timeout_ms, 250);
        assert_eq!(config.chat.negotiator.max_reconnect_attempts, 5);
        assert_eq!(config.chat.negotiator.fallback_delay_ms, 1_000);
        assert_eq!(config.chat.cancel_grace(), Duration::from_millis(100));
        assert_eq!(config.generation.model, "claude-haiku");
        assert_eq!(config.generation.timeout(), Duration::from_secs(3));
    }
}
