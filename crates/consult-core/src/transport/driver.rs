//! Client-side negotiation loop.
//!
//! Runs the [`Negotiator`] against a real [`TransportConnector`]: the
//! driver owns the timers (attach timeout, retry delay) that the state
//! machine only describes.

use std::future::Future;

use chrono::Utc;
use consult_types::error::TransportError;
use consult_types::transport::{
    ConnectionPhase, ConnectionState, NegotiatorConfig, TransportMode,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::negotiator::{
    InvalidTransition, NegotiationAction, NegotiationEvent, Negotiator, Transition,
};

/// Opens one transport connection for a session.
pub trait TransportConnector: Send + Sync {
    type Connection: Send;

    /// Attach over `mode`, asking the server to resume after `resume_from`.
    fn connect(
        &self,
        mode: TransportMode,
        resume_from: u64,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{mode} transport unavailable after {attempts} attempts")]
    Exhausted { mode: TransportMode, attempts: u32 },

    #[error("negotiation cancelled")]
    Cancelled,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("unexpected negotiation action: {0:?}")]
    Unexpected(NegotiationAction),
}

/// One client's view of its attachment to a session.
pub struct ClientNegotiation {
    negotiator: Negotiator,
    state: ConnectionState,
    pinned_to_pull: bool,
}

impl ClientNegotiation {
    pub fn new(config: NegotiatorConfig, session_id: Uuid) -> Self {
        let requested = config.mode;
        Self {
            negotiator: Negotiator::new(config),
            state: ConnectionState::new(session_id, requested),
            pinned_to_pull: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn pinned_to_pull(&self) -> bool {
        self.pinned_to_pull
    }

    pub fn acknowledge(&mut self, sequence: u64) {
        self.state.last_acked_sequence = self.state.last_acked_sequence.max(sequence);
    }

    /// Negotiate until a transport attaches, attempts run out, or `cancel` fires.
    ///
    /// A previous terminal failure is cleared first: calling this again is
    /// the client deciding to start over.
    pub async fn connect<C: TransportConnector>(
        &mut self,
        connector: &C,
        cancel: &CancellationToken,
    ) -> Result<(TransportMode, C::Connection), NegotiationError> {
        if self.state.phase == ConnectionPhase::Failed {
            self.apply(NegotiationEvent::Reset)?;
        }
        if let Some(not_before) = self.state.next_retry_not_before {
            if let Ok(wait) = (not_before - Utc::now()).to_std() {
                self.sleep(wait, cancel).await?;
            }
        }

        let mut action = self.apply(NegotiationEvent::Start)?.action;
        loop {
            match action {
                NegotiationAction::Attempt(mode) => {
                    let resume_from = self.state.last_acked_sequence;
                    let outcome = self.attempt(connector, mode, resume_from, cancel).await?;
                    let event = match outcome {
                        Ok(connection) => {
                            self.apply(NegotiationEvent::AttachSucceeded)?;
                            info!(session_id = %self.state.session_id, %mode, "Transport connected");
                            return Ok((mode, connection));
                        }
                        Err(TransportError::AttachTimedOut(ms)) => {
                            debug!(session_id = %self.state.session_id, %mode, timeout_ms = ms, "Attach timed out");
                            NegotiationEvent::AttachTimedOut
                        }
                        Err(TransportError::Redirected(TransportMode::Pull))
                            if !self.state.requested_mode.is_forced() =>
                        {
                            // The server already pinned this session to pull.
                            self.pinned_to_pull = true;
                            self.apply(NegotiationEvent::Reset)?;
                            action = self.apply(NegotiationEvent::Start)?.action;
                            continue;
                        }
                        Err(err) => {
                            warn!(session_id = %self.state.session_id, %mode, error = %err, "Attach failed");
                            NegotiationEvent::AttachFailed
                        }
                    };
                    action = self.apply(event)?.action;
                }
                NegotiationAction::RetryAfter { delay, .. } => {
                    self.sleep(delay, cancel).await?;
                    action = self.apply(NegotiationEvent::Start)?.action;
                }
                NegotiationAction::Terminal { mode, attempts } => {
                    return Err(NegotiationError::Exhausted { mode, attempts });
                }
                other => return Err(NegotiationError::Unexpected(other)),
            }
        }
    }

    /// Report that the established transport dropped. Call
    /// [`connect`](Self::connect) afterwards to re-establish it.
    pub fn connection_lost(&mut self) -> Result<Transition, InvalidTransition> {
        self.apply(NegotiationEvent::ConnectionLost)
    }

    pub fn detach(&mut self) {
        // Detach is valid from every phase but FallingBack, which never rests.
        let _ = self.apply(NegotiationEvent::Detach);
    }

    async fn attempt<C: TransportConnector>(
        &self,
        connector: &C,
        mode: TransportMode,
        resume_from: u64,
        cancel: &CancellationToken,
    ) -> Result<Result<C::Connection, TransportError>, NegotiationError> {
        let config = self.negotiator.config();
        let attempt = connector.connect(mode, resume_from);
        let result = match mode {
            TransportMode::Push => {
                let timeout = config.push_attach_timeout();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(NegotiationError::Cancelled),
                    r = tokio::time::timeout(timeout, attempt) => match r {
                        Ok(r) => r,
                        Err(_) => Err(TransportError::AttachTimedOut(config.push_attach_timeout_ms)),
                    },
                }
            }
            TransportMode::Pull => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(NegotiationError::Cancelled),
                    r = attempt => r,
                }
            }
        };
        Ok(result)
    }

    async fn sleep(
        &self,
        delay: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<(), NegotiationError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn apply(&mut self, event: NegotiationEvent) -> Result<Transition, InvalidTransition> {
        let transition =
            self.negotiator
                .apply(&mut self.state, self.pinned_to_pull, event, Utc::now())?;
        if transition.fell_back {
            self.pinned_to_pull = true;
        }
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_types::transport::RequestedMode;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Step {
        Ok,
        Fail,
        Hang,
        RedirectPull,
    }

    /// Connector that replays a fixed script and records every call.
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(TransportMode, u64)>>,
    }

    impl Scripted {
        fn new(steps: &[Step]) -> Self {
            Self {
                steps: Mutex::new(steps.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(TransportMode, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TransportConnector for Scripted {
        type Connection = TransportMode;

        fn connect(
            &self,
            mode: TransportMode,
            resume_from: u64,
        ) -> impl Future<Output = Result<TransportMode, TransportError>> + Send {
            self.calls.lock().unwrap().push((mode, resume_from));
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Fail);
            async move {
                match step {
                    Step::Ok => Ok(mode),
                    Step::Fail => Err(TransportError::AttachFailed("refused".into())),
                    Step::Hang => std::future::pending().await,
                    Step::RedirectPull => Err(TransportError::Redirected(TransportMode::Pull)),
                }
            }
        }
    }

    fn config(mode: RequestedMode) -> NegotiatorConfig {
        NegotiatorConfig {
            mode,
            push_attach_timeout_ms: 500,
            fallback_delay_ms: 100,
            max_reconnect_attempts: 3,
            ..NegotiatorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_falls_back_to_pull_after_push_timeout() {
        let mut client = ClientNegotiation::new(config(RequestedMode::Auto), Uuid::now_v7());
        let connector = Scripted::new(&[Step::Hang, Step::Ok]);
        let started = tokio::time::Instant::now();

        let (mode, _) = client
            .connect(&connector, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mode, TransportMode::Pull);
        assert!(client.pinned_to_pull());
        assert_eq!(client.state().phase, ConnectionPhase::ConnectedPull);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(
            connector.calls(),
            vec![(TransportMode::Push, 0), (TransportMode::Pull, 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn forced_push_stops_after_max_attempts() {
        let mut client = ClientNegotiation::new(config(RequestedMode::Push), Uuid::now_v7());
        let connector = Scripted::new(&[Step::Fail, Step::Fail, Step::Fail, Step::Ok]);

        let err = client
            .connect(&connector, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            NegotiationError::Exhausted {
                mode: TransportMode::Push,
                attempts: 3
            }
        ));
        assert_eq!(connector.calls().len(), 3);
        assert!(connector.calls().iter().all(|(m, _)| *m == TransportMode::Push));
        assert!(client.state().terminal_failure);

        // Starting over clears the terminal failure.
        let (mode, _) = client
            .connect(&connector, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mode, TransportMode::Push);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_push_timeouts_never_switch_to_pull() {
        let mut client = ClientNegotiation::new(config(RequestedMode::Push), Uuid::now_v7());
        let connector = Scripted::new(&[Step::Hang, Step::Hang, Step::Hang]);

        let err = client
            .connect(&connector, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Exhausted { .. }));
        assert!(!client.pinned_to_pull());
        assert!(connector.calls().iter().all(|(m, _)| *m == TransportMode::Push));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_from_last_ack() {
        let mut client = ClientNegotiation::new(config(RequestedMode::Auto), Uuid::now_v7());
        let connector = Scripted::new(&[Step::Ok, Step::Ok]);
        let cancel = CancellationToken::new();

        client.connect(&connector, &cancel).await.unwrap();
        client.acknowledge(6);
        let t = client.connection_lost().unwrap();
        assert!(matches!(t.action, NegotiationAction::RetryAfter { .. }));

        let (mode, _) = client.connect(&connector, &cancel).await.unwrap();
        assert_eq!(mode, TransportMode::Push);
        assert_eq!(connector.calls()[1], (TransportMode::Push, 6));
    }

    #[tokio::test(start_paused = true)]
    async fn server_redirect_pins_auto_client_to_pull() {
        let mut client = ClientNegotiation::new(config(RequestedMode::Auto), Uuid::now_v7());
        let connector = Scripted::new(&[Step::RedirectPull, Step::Ok]);

        let (mode, _) = client
            .connect(&connector, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mode, TransportMode::Pull);
        assert!(client.pinned_to_pull());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_retry_delay() {
        let mut client = ClientNegotiation::new(
            NegotiatorConfig {
                fallback_delay_ms: 60_000,
                ..config(RequestedMode::Push)
            },
            Uuid::now_v7(),
        );
        let connector = Scripted::new(&[Step::Fail]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = client.connect(&connector, &cancel).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Cancelled));
        assert_eq!(connector.calls().len(), 1);
    }
}
