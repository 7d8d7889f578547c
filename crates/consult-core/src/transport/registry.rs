//! Per-session connection registry.
//!
//! Holds one [`ConnectionState`] and at most one active adapter per session
//! in a [`DashMap`]. Every phase change goes through [`Negotiator::apply`];
//! handlers never mutate connection state directly.
//!
//! The "auto fell back to pull" pin is kept separately from the per-attachment
//! state so it survives detach/reattach for the rest of the session's life.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use consult_types::error::{ChatError, ValidationError};
use consult_types::transport::{
    ConnectionPhase, ConnectionState, NegotiatorConfig, RequestedMode, TransportMode,
};
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adapter::{PullAdapter, TransportAdapter};
use super::negotiator::{
    InvalidTransition, NegotiationAction, NegotiationEvent, Negotiator, Transition,
};

/// Outcome of a client offering a transport for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Go ahead and attach; the client resumes after `resume_from`.
    Proceed { resume_from: u64 },
    /// This session must use another transport.
    Redirect(TransportMode),
}

struct Attachment {
    state: ConnectionState,
    adapter: Option<Arc<dyn TransportAdapter>>,
}

/// Concurrency-safe map of live client attachments keyed by session id.
pub struct ConnectionRegistry {
    negotiator: Negotiator,
    entries: DashMap<Uuid, Attachment>,
    pinned_to_pull: DashSet<Uuid>,
}

impl ConnectionRegistry {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self {
            negotiator: Negotiator::new(config),
            entries: DashMap::new(),
            pinned_to_pull: DashSet::new(),
        }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        self.negotiator.config()
    }

    /// A client is arriving on `mode` for `session_id`.
    ///
    /// A session whose previous forced-mode negotiation ended terminally
    /// reports the connectivity error once and is reset to `Disconnected`,
    /// so the following offer starts over.
    pub fn offer(
        &self,
        session_id: Uuid,
        requested: RequestedMode,
        mode: TransportMode,
        last_acked: u64,
    ) -> Result<OfferOutcome, ChatError> {
        let pinned = self.is_pinned_to_pull(&session_id);
        let mut entry = self.entries.entry(session_id).or_insert_with(|| Attachment {
            state: ConnectionState::new(session_id, requested),
            adapter: None,
        });
        let state = &mut entry.state;
        state.requested_mode = requested;

        if state.phase == ConnectionPhase::Failed {
            let attempts = state.consecutive_failures;
            let failed_mode = state_mode(requested);
            self.apply(state, pinned, NegotiationEvent::Reset)?;
            return Err(ChatError::Connectivity {
                mode: failed_mode,
                attempts,
            });
        }

        let transition = self.apply(state, pinned, NegotiationEvent::Offer(mode))?;
        match transition.action {
            NegotiationAction::Redirect(other) => {
                Ok(OfferOutcome::Redirect(other))
            }
            _ => {
                state.last_acked_sequence = last_acked;
                Ok(OfferOutcome::Proceed {
                    resume_from: last_acked,
                })
            }
        }
    }

    /// Install `adapter` as the session's only active transport.
    ///
    /// Any previous adapter is closed. The message log is untouched.
    pub fn attach_succeeded(
        &self,
        session_id: Uuid,
        adapter: Arc<dyn TransportAdapter>,
    ) -> Result<(), ChatError> {
        let pinned = self.is_pinned_to_pull(&session_id);
        let mut entry = self
            .entries
            .get_mut(&session_id)
            .ok_or_else(|| ValidationError::Invalid(format!(
                "no pending attachment for session {session_id}"
            )))?;
        self.apply(&mut entry.state, pinned, NegotiationEvent::AttachSucceeded)?;

        let mode = adapter.mode();
        let new_id = adapter.id();
        if let Some(previous) = entry.adapter.replace(adapter) {
            if previous.id() != new_id {
                debug!(%session_id, replaced = %previous.mode(), "Superseding previous transport");
                previous.close();
            }
        }
        info!(%session_id, %mode, "Transport attached");
        Ok(())
    }

    /// Record a failed or timed-out attach attempt.
    pub fn attach_failed(&self, session_id: Uuid, timed_out: bool) -> Result<Transition, ChatError> {
        let pinned = self.is_pinned_to_pull(&session_id);
        let mut entry = self
            .entries
            .get_mut(&session_id)
            .ok_or_else(|| ValidationError::Invalid(format!(
                "no pending attachment for session {session_id}"
            )))?;
        let event = if timed_out {
            NegotiationEvent::AttachTimedOut
        } else {
            NegotiationEvent::AttachFailed
        };
        let transition = self.apply(&mut entry.state, pinned, event)?;
        drop(entry);
        if transition.fell_back {
            self.pinned_to_pull.insert(session_id);
        }
        Ok(transition)
    }

    /// The transport identified by `adapter_id` dropped unexpectedly.
    ///
    /// Stale notifications from an already superseded adapter are ignored.
    pub fn connection_lost(&self, session_id: Uuid, adapter_id: u64) -> Option<Transition> {
        let pinned = self.is_pinned_to_pull(&session_id);
        let mut entry = self.entries.get_mut(&session_id)?;
        if entry.adapter.as_ref().map(|a| a.id()) != Some(adapter_id) {
            return None;
        }
        if let Some(adapter) = entry.adapter.take() {
            adapter.close();
        }
        let transition = match self.negotiator.apply(
            &mut entry.state,
            pinned,
            NegotiationEvent::ConnectionLost,
            Utc::now(),
        ) {
            Ok(t) => t,
            Err(err) => {
                warn!(%session_id, error = %err, "Ignoring connection loss");
                return None;
            }
        };
        drop(entry);
        if transition.fell_back {
            self.pinned_to_pull.insert(session_id);
        }
        Some(transition)
    }

    /// Clean client detach: the connection state is destroyed.
    pub fn detach(&self, session_id: Uuid, adapter_id: u64) {
        let removed = self.entries.remove_if(&session_id, |_, entry| {
            entry.adapter.as_ref().map(|a| a.id()) == Some(adapter_id)
        });
        if let Some((_, entry)) = removed {
            if let Some(adapter) = entry.adapter {
                adapter.close();
            }
            debug!(%session_id, "Client detached");
        }
    }

    /// Pull traffic for a session: attach a pull adapter unless a push
    /// adapter is live or the client is forced onto push.
    ///
    /// An `auto` client only polls after its own push attempts failed, so
    /// its pull traffic pins the session to pull.
    ///
    /// Returns the transport in use afterwards, if any.
    pub fn ensure_pull(&self, session_id: Uuid, requested: RequestedMode) -> Option<TransportMode> {
        if let Some(entry) = self.entries.get(&session_id) {
            match entry.state.phase {
                ConnectionPhase::ConnectedPush | ConnectionPhase::ConnectedPull => {
                    return entry.state.current_mode;
                }
                ConnectionPhase::Failed => return None,
                _ => {}
            }
        }

        let (requested, last_acked) = self
            .entries
            .get(&session_id)
            .map(|e| (e.state.requested_mode, e.state.last_acked_sequence))
            .unwrap_or((requested, 0));

        if requested == RequestedMode::Auto && self.pinned_to_pull.insert(session_id) {
            info!(%session_id, "Auto client polling, pinning session to pull");
        }

        match self.offer(session_id, requested, TransportMode::Pull, last_acked) {
            Ok(OfferOutcome::Proceed { .. }) => {}
            Ok(OfferOutcome::Redirect(_)) | Err(_) => return None,
        }
        match self.attach_succeeded(session_id, Arc::new(PullAdapter::new())) {
            Ok(()) => Some(TransportMode::Pull),
            Err(err) => {
                warn!(%session_id, error = %err, "Pull attach failed");
                None
            }
        }
    }

    /// Record the highest sequence the client has seen.
    pub fn acknowledge(&self, session_id: Uuid, sequence: u64) {
        if let Some(mut entry) = self.entries.get_mut(&session_id) {
            entry.state.last_acked_sequence = entry.state.last_acked_sequence.max(sequence);
        }
    }

    /// The session's active adapter, if it is still open.
    pub fn active_adapter(&self, session_id: &Uuid) -> Option<Arc<dyn TransportAdapter>> {
        self.entries
            .get(session_id)
            .and_then(|e| e.adapter.clone())
            .filter(|a| a.is_open())
    }

    pub fn has_open_adapter(&self, session_id: &Uuid) -> bool {
        self.active_adapter(session_id).is_some()
    }

    /// Drop all connection state for a closed session.
    pub fn session_closed(&self, session_id: &Uuid) {
        if let Some((_, entry)) = self.entries.remove(session_id) {
            if let Some(adapter) = entry.adapter {
                adapter.close();
            }
        }
        self.pinned_to_pull.remove(session_id);
    }

    pub fn state(&self, session_id: &Uuid) -> Option<ConnectionState> {
        self.entries.get(session_id).map(|e| e.state.clone())
    }

    pub fn is_pinned_to_pull(&self, session_id: &Uuid) -> bool {
        self.pinned_to_pull.contains(session_id)
    }

    /// Connected attachments per transport.
    pub fn mode_counts(&self) -> HashMap<TransportMode, u64> {
        let mut counts = HashMap::new();
        for entry in self.entries.iter() {
            if let Some(mode) = entry.state.current_mode {
                *counts.entry(mode).or_insert(0) += 1;
            }
        }
        counts
    }

    fn apply(
        &self,
        state: &mut ConnectionState,
        pinned: bool,
        event: NegotiationEvent,
    ) -> Result<Transition, ChatError> {
        self.negotiator
            .apply(state, pinned, event, Utc::now())
            .map_err(|e: InvalidTransition| ValidationError::Invalid(e.to_string()).into())
    }
}

fn state_mode(requested: RequestedMode) -> TransportMode {
    match requested {
        RequestedMode::Pull => TransportMode::Pull,
        _ => TransportMode::Push,
    }
}
