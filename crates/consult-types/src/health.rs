//! Health snapshot returned by the chat health endpoint.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Point-in-time view of the chat subsystem counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub active_sessions: u64,
    /// Attached clients keyed by current transport ("push" / "pull").
    pub sessions_by_mode: HashMap<String, u64>,
    /// Generation calls observed in the sliding window.
    pub generation_calls: u64,
    /// Share of those calls that ended on the fallback path (0.0 - 1.0).
    pub fallback_rate: f64,
    pub total_fallbacks: u64,
    pub average_latency_ms: f64,
    pub storage_errors: u64,
    pub window_secs: u64,
}
