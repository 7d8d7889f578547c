//! Background inactivity sweep.
//!
//! Active sessions with no activity for `idle_after_secs` become idle; any
//! open session quiet for `close_after_secs` is closed through the
//! orchestrator so its transport state and in-flight work are released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use consult_types::config::SessionPolicy;
use consult_types::error::RepositoryError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::orchestrator::ChatOrchestrator;
use super::repository::{MessageLog, SessionStore};

/// Result of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub idled: u64,
    pub closed: usize,
}

pub struct SessionReaper<S: SessionStore, L: MessageLog> {
    orchestrator: Arc<ChatOrchestrator<S, L>>,
    policy: SessionPolicy,
}

impl<S, L> SessionReaper<S, L>
where
    S: SessionStore + 'static,
    L: MessageLog + 'static,
{
    pub fn new(orchestrator: Arc<ChatOrchestrator<S, L>>, policy: SessionPolicy) -> Self {
        Self {
            orchestrator,
            policy,
        }
    }

    /// Apply the inactivity policy as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, RepositoryError> {
        let store = self.orchestrator.sessions();
        let close_cutoff = now - chrono::Duration::seconds(self.policy.close_after_secs as i64);
        let closed = store.close_idle_before(close_cutoff).await?;
        for session_id in &closed {
            info!(%session_id, "Closing inactive session");
            self.orchestrator.session_closed(*session_id);
        }

        let idle_cutoff = now - chrono::Duration::seconds(self.policy.idle_after_secs as i64);
        let idled = store.mark_idle_before(idle_cutoff).await?;

        Ok(SweepReport {
            idled,
            closed: closed.len(),
        })
    }

    /// Sweep every `sweep_interval_secs` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.policy.sweep_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(idled = report.idled, closed = report.closed, "Session sweep");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "Session sweep failed");
                            self.orchestrator.health().record_storage_error();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::memory::{InMemoryMessageLog, InMemorySessionStore};
    use crate::health::monitor::HealthMonitor;
    use crate::llm::backend::GenerationBackend;
    use crate::llm::box_backend::BoxGenerationBackend;
    use crate::llm::synthesizer::ResponseSynthesizer;
    use crate::transport::registry::ConnectionRegistry;
    use consult_types::chat::{SessionContext, SessionStatus};
    use consult_types::config::{GenerationConfig, HealthConfig};
    use consult_types::llm::{GenerationError, GenerationRequest, GenerationResponse};
    use consult_types::transport::NegotiatorConfig;

    struct Offline;

    impl GenerationBackend for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationResponse, GenerationError> {
            Err(GenerationError::NotConfigured)
        }
    }

    fn reaper() -> SessionReaper<InMemorySessionStore, InMemoryMessageLog> {
        let orchestrator = Arc::new(ChatOrchestrator::new(
            InMemorySessionStore::new(),
            InMemoryMessageLog::new(),
            ResponseSynthesizer::new(BoxGenerationBackend::new(Offline), GenerationConfig::default()),
            Arc::new(ConnectionRegistry::new(NegotiatorConfig::default())),
            Arc::new(HealthMonitor::new(&HealthConfig::default())),
            Duration::from_secs(1),
        ));
        SessionReaper::new(
            orchestrator,
            SessionPolicy {
                idle_after_secs: 60,
                close_after_secs: 3_600,
                sweep_interval_secs: 1,
            },
        )
    }

    fn ctx() -> SessionContext {
        SessionContext {
            label: "x".into(),
            priority: None,
        }
    }

    #[tokio::test]
    async fn quiet_sessions_go_idle_then_closed() {
        let reaper = reaper();
        let s = reaper.orchestrator.create_session("alice", ctx()).await.unwrap();
        let store = reaper.orchestrator.sessions();

        let report = reaper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());

        let report = reaper
            .sweep(Utc::now() + chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(report.idled, 1);
        let got = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(got.status, SessionStatus::Idle);

        let report = reaper
            .sweep(Utc::now() + chrono::Duration::seconds(7_200))
            .await
            .unwrap();
        assert_eq!(report.closed, 1);
        let got = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(got.status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn sweep_surfaces_storage_errors() {
        let reaper = reaper();
        reaper.orchestrator.sessions().set_available(false);
        assert!(reaper.sweep(Utc::now()).await.is_err());
    }
}
