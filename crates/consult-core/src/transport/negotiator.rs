//! Transport negotiation state machine.
//!
//! [`Negotiator::apply`] is the only place a [`ConnectionState`] changes
//! phase. It is a pure function of (config, state, event, now) so every
//! fallback and retry rule can be tested without a live transport. Timers
//! are not run here: the caller receives a [`NegotiationAction`] telling it
//! what to attempt next and how long to wait.
//!
//! Phases:
//!
//! ```text
//! Disconnected -> AttemptingPush -> ConnectedPush
//! Disconnected -> AttemptingPull -> ConnectedPull
//! AttemptingPush -> FallingBack -> AttemptingPull          (auto only)
//! ConnectedPush -> Reconnecting -> AttemptingPush | AttemptingPull
//! Attempting* -> Failed                                    (forced, attempts exhausted)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use consult_types::transport::{
    ConnectionPhase, ConnectionState, NegotiatorConfig, RequestedMode, TransportMode,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Begin negotiating; the negotiator picks the transport.
    Start,
    /// The client is already arriving on this transport.
    Offer(TransportMode),
    AttachSucceeded,
    AttachFailed,
    /// No successful attach within `push_attach_timeout`.
    AttachTimedOut,
    /// An established transport dropped.
    ConnectionLost,
    /// Clear a terminal failure so the client may start over.
    Reset,
    Detach,
}

/// What the caller should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationAction {
    /// Attempt to attach over this transport now.
    Attempt(TransportMode),
    /// Wait `delay`, then attempt `mode` again.
    RetryAfter { mode: TransportMode, delay: Duration },
    /// The client must use another transport for this session.
    Redirect(TransportMode),
    Connected(TransportMode),
    /// Attempts exhausted in a forced mode.
    Terminal { mode: TransportMode, attempts: u32 },
    None,
}

/// Result of [`Negotiator::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: NegotiationAction,
    /// True when this transition moved an `auto` session onto pull for good.
    pub fell_back: bool,
}

impl Transition {
    fn act(action: NegotiationAction) -> Self {
        Self {
            action,
            fell_back: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: {event:?} in phase {phase:?}")]
pub struct InvalidTransition {
    pub phase: ConnectionPhase,
    pub event: NegotiationEvent,
}

/// Stateless transition logic parameterised by [`NegotiatorConfig`].
#[derive(Debug, Clone)]
pub struct Negotiator {
    config: NegotiatorConfig,
}

impl Negotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Transport a client should try first.
    ///
    /// Once an `auto` session has fallen back it stays on pull.
    pub fn initial_mode(requested: RequestedMode, pinned_to_pull: bool) -> TransportMode {
        match requested {
            RequestedMode::Pull => TransportMode::Pull,
            RequestedMode::Push => TransportMode::Push,
            RequestedMode::Auto if pinned_to_pull => TransportMode::Pull,
            RequestedMode::Auto => TransportMode::Push,
        }
    }

    /// Apply `event` to `state`.
    ///
    /// `pinned_to_pull` is owned by the caller because it must outlive any
    /// single `ConnectionState` for the session.
    pub fn apply(
        &self,
        state: &mut ConnectionState,
        pinned_to_pull: bool,
        event: NegotiationEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, InvalidTransition> {
        use ConnectionPhase as P;
        use NegotiationEvent as E;

        let invalid = InvalidTransition {
            phase: state.phase,
            event,
        };

        let transition = match (state.phase, event) {
            (P::Failed, E::Start | E::Offer(_)) => return Err(invalid),
            (P::FallingBack, _) => return Err(invalid),

            (_, E::Start) => {
                let mode = Self::initial_mode(state.requested_mode, pinned_to_pull);
                self.begin_attempt(state, mode)
            }

            (_, E::Offer(mode)) => {
                let allowed = Self::initial_mode(state.requested_mode, pinned_to_pull);
                if mode != allowed {
                    debug!(
                        session_id = %state.session_id,
                        offered = %mode,
                        allowed = %allowed,
                        "Transport offer redirected"
                    );
                    Transition::act(NegotiationAction::Redirect(allowed))
                } else {
                    self.begin_attempt(state, mode)
                }
            }

            (P::AttemptingPush, E::AttachSucceeded) => self.connected(state, TransportMode::Push),
            (P::AttemptingPull, E::AttachSucceeded) => self.connected(state, TransportMode::Pull),

            (P::AttemptingPush, E::AttachTimedOut)
                if state.requested_mode == RequestedMode::Auto =>
            {
                state.consecutive_failures += 1;
                self.fall_back(state)
            }
            (P::AttemptingPush, E::AttachFailed | E::AttachTimedOut) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures < self.config.max_reconnect_attempts {
                    self.schedule_retry(state, TransportMode::Push, now)
                } else if state.requested_mode == RequestedMode::Auto {
                    self.fall_back(state)
                } else {
                    self.fail(state, TransportMode::Push)
                }
            }
            (P::AttemptingPull, E::AttachFailed | E::AttachTimedOut) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures < self.config.max_reconnect_attempts {
                    self.schedule_retry(state, TransportMode::Pull, now)
                } else {
                    self.fail(state, TransportMode::Pull)
                }
            }

            (P::ConnectedPush, E::ConnectionLost) => {
                state.consecutive_failures += 1;
                state.phase = P::Reconnecting;
                state.current_mode = None;
                let exhausted = state.consecutive_failures >= self.config.max_reconnect_attempts;
                let mut fell_back = false;
                let mode = if state.requested_mode == RequestedMode::Auto
                    && (pinned_to_pull || exhausted)
                {
                    fell_back = !pinned_to_pull;
                    TransportMode::Pull
                } else {
                    TransportMode::Push
                };
                let delay = self.config.fallback_delay();
                state.next_retry_not_before = Some(now + chrono_delay(delay));
                info!(
                    session_id = %state.session_id,
                    failures = state.consecutive_failures,
                    next_mode = %mode,
                    "Push transport lost, reconnecting"
                );
                Transition {
                    action: NegotiationAction::RetryAfter { mode, delay },
                    fell_back,
                }
            }
            (P::ConnectedPull, E::ConnectionLost) => {
                state.phase = P::Disconnected;
                state.current_mode = None;
                Transition::act(NegotiationAction::None)
            }
            (P::Disconnected | P::Reconnecting | P::Failed, E::ConnectionLost) => {
                Transition::act(NegotiationAction::None)
            }

            (_, E::Reset) => {
                state.phase = P::Disconnected;
                state.current_mode = None;
                state.consecutive_failures = 0;
                state.terminal_failure = false;
                state.next_retry_not_before = None;
                Transition::act(NegotiationAction::None)
            }
            (_, E::Detach) => {
                state.phase = P::Disconnected;
                state.current_mode = None;
                state.next_retry_not_before = None;
                Transition::act(NegotiationAction::None)
            }

            _ => return Err(invalid),
        };

        Ok(transition)
    }

    fn begin_attempt(&self, state: &mut ConnectionState, mode: TransportMode) -> Transition {
        state.phase = match mode {
            TransportMode::Push => ConnectionPhase::AttemptingPush,
            TransportMode::Pull => ConnectionPhase::AttemptingPull,
        };
        state.current_mode = None;
        state.next_retry_not_before = None;
        Transition::act(NegotiationAction::Attempt(mode))
    }

    fn connected(&self, state: &mut ConnectionState, mode: TransportMode) -> Transition {
        state.phase = match mode {
            TransportMode::Push => ConnectionPhase::ConnectedPush,
            TransportMode::Pull => ConnectionPhase::ConnectedPull,
        };
        state.current_mode = Some(mode);
        state.consecutive_failures = 0;
        state.terminal_failure = false;
        state.next_retry_not_before = None;
        Transition::act(NegotiationAction::Connected(mode))
    }

    fn schedule_retry(
        &self,
        state: &mut ConnectionState,
        mode: TransportMode,
        now: DateTime<Utc>,
    ) -> Transition {
        let delay = self.config.fallback_delay();
        state.next_retry_not_before = Some(now + chrono_delay(delay));
        debug!(
            session_id = %state.session_id,
            mode = %mode,
            failures = state.consecutive_failures,
            "Attach failed, retrying"
        );
        Transition::act(NegotiationAction::RetryAfter { mode, delay })
    }

    /// `AttemptingPush -> FallingBack -> AttemptingPull`. The failure
    /// counter restarts so pull gets its own attempt budget.
    fn fall_back(&self, state: &mut ConnectionState) -> Transition {
        state.phase = ConnectionPhase::FallingBack;
        info!(
            session_id = %state.session_id,
            failures = state.consecutive_failures,
            "Falling back to pull transport"
        );
        state.consecutive_failures = 0;
        let mut transition = self.begin_attempt(state, TransportMode::Pull);
        transition.fell_back = true;
        transition
    }

    fn fail(&self, state: &mut ConnectionState, mode: TransportMode) -> Transition {
        state.phase = ConnectionPhase::Failed;
        state.current_mode = None;
        state.terminal_failure = true;
        state.next_retry_not_before = None;
        warn!(
            session_id = %state.session_id,
            mode = %mode,
            attempts = state.consecutive_failures,
            "Transport attempts exhausted"
        );
        Transition::act(NegotiationAction::Terminal {
            mode,
            attempts: state.consecutive_failures,
        })
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
}
