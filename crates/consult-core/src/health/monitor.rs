//! HealthMonitor: sliding-window generation outcomes, latency and storage errors.
//!
//! The subsystem is healthy while the fallback rate over the window stays
//! below the configured threshold and no storage error occurred in it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use consult_types::config::HealthConfig;
use consult_types::health::HealthSnapshot;
use consult_types::transport::TransportMode;

#[derive(Debug, Default)]
struct Counters {
    /// (when, used_fallback) per generation call, oldest first.
    outcomes: VecDeque<(Instant, bool)>,
    storage_errors: VecDeque<Instant>,
    total_fallbacks: u64,
    latency_samples: u64,
    latency_mean_ms: f64,
}

impl Counters {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
        while let Some(at) = self.storage_errors.front() {
            if now.duration_since(*at) > window {
                self.storage_errors.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct HealthMonitor {
    window: Duration,
    failure_rate_threshold: f64,
    counters: Mutex<Counters>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            failure_rate_threshold: config.failure_rate_threshold,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_generation(&self, fallback: bool) {
        self.record_generation_at(Instant::now(), fallback);
    }

    fn record_generation_at(&self, now: Instant, fallback: bool) {
        let mut c = self.counters();
        c.outcomes.push_back((now, fallback));
        if fallback {
            c.total_fallbacks += 1;
        }
        c.prune(now, self.window);
    }

    /// Fold one end-to-end message latency into the running mean.
    pub fn record_latency(&self, elapsed: Duration) {
        let mut c = self.counters();
        c.latency_samples += 1;
        let ms = elapsed.as_secs_f64() * 1_000.0;
        let delta = (ms - c.latency_mean_ms) / c.latency_samples as f64;
        c.latency_mean_ms += delta;
    }

    pub fn record_storage_error(&self) {
        self.record_storage_error_at(Instant::now());
    }

    fn record_storage_error_at(&self, now: Instant) {
        let mut c = self.counters();
        c.storage_errors.push_back(now);
        c.prune(now, self.window);
    }

    pub fn snapshot(
        &self,
        active_sessions: u64,
        by_mode: &HashMap<TransportMode, u64>,
    ) -> HealthSnapshot {
        self.snapshot_at(Instant::now(), active_sessions, by_mode)
    }

    fn snapshot_at(
        &self,
        now: Instant,
        active_sessions: u64,
        by_mode: &HashMap<TransportMode, u64>,
    ) -> HealthSnapshot {
        let mut c = self.counters();
        c.prune(now, self.window);

        let calls = c.outcomes.len() as u64;
        let fallbacks = c.outcomes.iter().filter(|(_, f)| *f).count() as f64;
        let fallback_rate = if calls == 0 { 0.0 } else { fallbacks / calls as f64 };
        let storage_errors = c.storage_errors.len() as u64;

        let mut sessions_by_mode: HashMap<String, u64> = [TransportMode::Push, TransportMode::Pull]
            .iter()
            .map(|m| (m.to_string(), 0))
            .collect();
        for (mode, count) in by_mode {
            sessions_by_mode.insert(mode.to_string(), *count);
        }

        HealthSnapshot {
            healthy: fallback_rate < self.failure_rate_threshold && storage_errors == 0,
            active_sessions,
            sessions_by_mode,
            generation_calls: calls,
            fallback_rate,
            total_fallbacks: c.total_fallbacks,
            average_latency_ms: c.latency_mean_ms,
            storage_errors,
            window_secs: self.window.as_secs(),
        }
    }
}
