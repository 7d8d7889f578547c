//! ChatOrchestrator: the inbound message pipeline.
//!
//! Every inbound message for a session goes through that session's FIFO
//! queue, drained by one worker task at a time. A message is accepted once
//! its content, ownership and session status check out; it is queued right
//! after and processed in acceptance order. Because processing runs on the
//! worker, a caller that goes away mid-request does not leave a user message
//! without its reply, and closing the session does not drop accepted work.
//!
//! Pipeline per message: append user message, load the history window,
//! synthesize, append assistant message, touch the session, deliver to the
//! active transport adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use consult_types::chat::{
    ChatMessage, ChatSession, MessageRole, Pagination, SessionContext, SessionFilter,
    SessionStatus, SessionUpdate,
};
use consult_types::error::{ChatError, RepositoryError, ValidationError};
use consult_types::transport::{RequestedMode, TransportMode};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::repository::{MessageLog, SessionStore};
use crate::health::monitor::HealthMonitor;
use crate::llm::synthesizer::ResponseSynthesizer;
use crate::transport::registry::ConnectionRegistry;

/// How long a session worker waits for more work before exiting.
const WORKER_IDLE: Duration = Duration::from_secs(30);

/// The two messages produced by one accepted inbound message.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub user: ChatMessage,
    pub assistant: ChatMessage,
}

struct InboundJob {
    principal: String,
    content: String,
    reply: oneshot::Sender<Result<Exchange, ChatError>>,
}

pub struct ChatOrchestrator<S: SessionStore, L: MessageLog> {
    sessions: S,
    log: L,
    synthesizer: ResponseSynthesizer,
    registry: Arc<ConnectionRegistry>,
    health: Arc<HealthMonitor>,
    queues: DashMap<Uuid, mpsc::UnboundedSender<InboundJob>>,
    in_flight: DashMap<Uuid, CancellationToken>,
    cancel_grace: Duration,
}

impl<S, L> ChatOrchestrator<S, L>
where
    S: SessionStore + 'static,
    L: MessageLog + 'static,
{
    pub fn new(
        sessions: S,
        log: L,
        synthesizer: ResponseSynthesizer,
        registry: Arc<ConnectionRegistry>,
        health: Arc<HealthMonitor>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            sessions,
            log,
            synthesizer,
            registry,
            health,
            queues: DashMap::new(),
            in_flight: DashMap::new(),
            cancel_grace,
        }
    }

    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    // --- Session lifecycle ---

    pub async fn create_session(
        &self,
        owner: &str,
        context: SessionContext,
    ) -> Result<ChatSession, ChatError> {
        let session = ChatSession::new(owner, context);
        let created = self
            .sessions
            .create_session(&session)
            .await
            .map_err(|e| self.storage(e))?;
        info!(session_id = %created.id, owner = %created.owner, "Session created");
        Ok(created)
    }

    /// Fetch a session the principal owns.
    pub async fn authorize(&self, session_id: Uuid, principal: &str) -> Result<ChatSession, ChatError> {
        let session = self
            .sessions
            .get_session(&session_id)
            .await
            .map_err(|e| self.storage(e))?
            .ok_or(ValidationError::SessionNotFound(session_id))?;
        if session.owner != principal {
            return Err(ChatError::Forbidden(session_id));
        }
        Ok(session)
    }

    pub async fn list_sessions(
        &self,
        principal: &str,
        mut filter: SessionFilter,
    ) -> Result<Vec<ChatSession>, ChatError> {
        filter.owner = Some(principal.to_string());
        self.sessions
            .list_sessions(&filter)
            .await
            .map_err(|e| self.storage(e))
    }

    pub async fn update_session(
        &self,
        session_id: Uuid,
        principal: &str,
        update: SessionUpdate,
    ) -> Result<ChatSession, ChatError> {
        self.authorize(session_id, principal).await?;
        if update.status == Some(SessionStatus::Closed) {
            self.close_session(session_id, principal).await?;
        }
        self.sessions
            .update_session(&session_id, &update)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => ValidationError::SessionNotFound(session_id).into(),
                RepositoryError::Conflict(_) => ValidationError::SessionClosed(session_id).into(),
                other => self.storage(other),
            })
    }

    /// Close a session. Closing an already closed session succeeds.
    ///
    /// New inbound messages are rejected from here on; an in-flight
    /// generation is cancelled after the grace period and still gets a reply.
    pub async fn close_session(&self, session_id: Uuid, principal: &str) -> Result<ChatSession, ChatError> {
        self.authorize(session_id, principal).await?;
        let closed_now = self
            .sessions
            .close_session(&session_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => ValidationError::SessionNotFound(session_id).into(),
                other => self.storage(other),
            })?;
        if closed_now {
            info!(%session_id, "Session closed");
        }
        self.session_closed(session_id);
        self.authorize(session_id, principal).await
    }

    /// Release transport state and schedule cancellation for a closed session.
    pub fn session_closed(&self, session_id: Uuid) {
        self.registry.session_closed(&session_id);
        self.cancel_in_flight_after_grace(session_id, false);
    }

    /// A push client dropped. Cancel in-flight work unless a transport is
    /// attached again within the grace period.
    pub fn client_disconnected(&self, session_id: Uuid) {
        self.cancel_in_flight_after_grace(session_id, true);
    }

    /// Mark transport traffic on a session. Closed sessions are left alone.
    pub async fn touch(&self, session_id: Uuid) {
        if let Err(err) = self.sessions.touch(&session_id).await {
            warn!(%session_id, error = %err, "Failed to touch session");
            self.health.record_storage_error();
        }
    }

    /// Record the transport the latest attachment negotiated.
    pub async fn record_transport(&self, session_id: Uuid, mode: TransportMode) -> Result<(), ChatError> {
        self.sessions
            .set_transport_mode(&session_id, Some(mode))
            .await
            .map_err(|e| self.storage(e))
    }

    // --- History ---

    /// Pull-mode read: messages after `after`, ascending. Empty is normal.
    ///
    /// Pull traffic attaches the pull adapter for sessions that have no
    /// live push connection and counts as session activity.
    pub async fn pull_since(
        &self,
        session_id: Uuid,
        principal: &str,
        requested: RequestedMode,
        after: u64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let session = self.authorize(session_id, principal).await?;
        if !session.is_closed() {
            self.touch(session_id).await;
            let mode = self.registry.ensure_pull(session_id, requested);
            self.registry.acknowledge(session_id, after);
            if mode.is_some() && mode != session.transport_mode {
                self.sessions
                    .set_transport_mode(&session_id, mode)
                    .await
                    .map_err(|e| self.storage(e))?;
            }
        }
        self.log
            .list_since(&session_id, after, limit)
            .await
            .map_err(|e| self.storage(e))
    }

    pub async fn history_page(
        &self,
        session_id: Uuid,
        principal: &str,
        page: Pagination,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.authorize(session_id, principal).await?;
        self.log
            .list_all(&session_id, page)
            .await
            .map_err(|e| self.storage(e))
    }

    // --- Inbound messages ---

    /// Accept one user message and wait for its exchange.
    pub async fn handle_inbound(
        self: &Arc<Self>,
        session_id: Uuid,
        principal: &str,
        content: &str,
    ) -> Result<Exchange, ChatError> {
        let content = self.validate_content(content)?;
        let session = self.authorize(session_id, principal).await?;
        if session.is_closed() {
            return Err(ValidationError::SessionClosed(session_id).into());
        }
        let (reply, rx) = oneshot::channel();
        self.enqueue(
            session_id,
            InboundJob {
                principal: principal.to_string(),
                content,
                reply,
            },
        );
        rx.await.map_err(|_| {
            ChatError::Storage(RepositoryError::Query(
                "message processing aborted".to_string(),
            ))
        })?
    }

    fn validate_content(&self, content: &str) -> Result<String, ValidationError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let max = self.synthesizer.config().max_message_chars;
        if trimmed.chars().count() > max {
            return Err(ValidationError::ContentTooLong { max });
        }
        Ok(trimmed.to_string())
    }

    /// Push `job` onto the session queue, starting a worker if none is live.
    ///
    /// Sends happen under the map entry lock so a worker can only retire
    /// while its queue is provably empty.
    fn enqueue(self: &Arc<Self>, session_id: Uuid, job: InboundJob) {
        let mut job = job;
        loop {
            match self.queues.entry(session_id) {
                Entry::Occupied(entry) => match entry.get().send(job) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(returned)) => {
                        // Worker died; replace it.
                        warn!(%session_id, "Session worker gone, restarting");
                        entry.remove();
                        job = returned;
                    }
                },
                Entry::Vacant(entry) => {
                    let sender = self.spawn_worker(session_id);
                    match sender.send(job) {
                        Ok(()) => {
                            entry.insert(sender);
                            return;
                        }
                        Err(mpsc::error::SendError(returned)) => job = returned,
                    }
                }
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, session_id: Uuid) -> mpsc::UnboundedSender<InboundJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundJob>();
        let own = tx.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            debug!(%session_id, "Session worker started");
            loop {
                match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
                    Ok(Some(job)) => {
                        let result = this.process(session_id, &job.principal, &job.content).await;
                        // The caller may have gone away; the exchange is stored either way.
                        let _ = job.reply.send(result);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let retired = this
                            .queues
                            .remove_if(&session_id, |_, s| s.same_channel(&own) && rx.is_empty());
                        if retired.is_some() {
                            break;
                        }
                    }
                }
            }
            debug!(%session_id, "Session worker stopped");
        });
        tx
    }

    async fn process(
        &self,
        session_id: Uuid,
        principal: &str,
        content: &str,
    ) -> Result<Exchange, ChatError> {
        let cancel = CancellationToken::new();
        self.in_flight.insert(session_id, cancel.clone());
        let result = self.exchange(session_id, principal, content, &cancel).await;
        self.in_flight.remove(&session_id);
        result
    }

    /// Run one accepted message to completion. A close that lands after
    /// acceptance only shortens generation through `cancel`.
    async fn exchange(
        &self,
        session_id: Uuid,
        principal: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<Exchange, ChatError> {
        let started = Instant::now();
        let session = self.authorize(session_id, principal).await?;

        let user = self
            .log
            .append(&session_id, MessageRole::User, content)
            .await
            .map_err(|e| self.storage(e))?;
        let history = self
            .log
            .recent(&session_id, self.synthesizer.config().history_window)
            .await
            .map_err(|e| self.storage(e))?;

        let reply = self.synthesizer.synthesize(&session, &history, cancel).await;
        self.health.record_generation(reply.is_fallback());

        let assistant = self
            .log
            .append(&session_id, MessageRole::Assistant, &reply.content)
            .await
            .map_err(|e| self.storage(e))?;

        // The exchange is already stored; a stale activity stamp is recoverable.
        self.touch(session_id).await;

        self.deliver(session_id, &assistant).await;
        self.health.record_latency(started.elapsed());
        debug!(
            %session_id,
            user_seq = user.sequence,
            assistant_seq = assistant.sequence,
            fallback = reply.is_fallback(),
            "Exchange complete"
        );
        Ok(Exchange { user, assistant })
    }

    async fn deliver(&self, session_id: Uuid, message: &ChatMessage) {
        let Some(adapter) = self.registry.active_adapter(&session_id) else {
            return;
        };
        if let Err(err) = adapter.deliver(message).await {
            warn!(
                %session_id,
                mode = %adapter.mode(),
                error = %err,
                "Delivery failed, client will resume from history"
            );
            adapter.close();
            self.registry.connection_lost(session_id, adapter.id());
        }
    }

    fn cancel_in_flight_after_grace(&self, session_id: Uuid, only_if_detached: bool) {
        let Some(token) = self.in_flight.get(&session_id).map(|t| t.clone()) else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if only_if_detached && registry.has_open_adapter(&session_id) {
                return;
            }
            if !token.is_cancelled() {
                debug!(%session_id, "Cancelling in-flight generation");
                token.cancel();
            }
        });
    }

    fn storage(&self, err: RepositoryError) -> ChatError {
        warn!(error = %err, "Storage failure");
        self.health.record_storage_error();
        ChatError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::memory::{InMemoryMessageLog, InMemorySessionStore};
    use crate::llm::backend::GenerationBackend;
    use crate::llm::box_backend::BoxGenerationBackend;
    use crate::llm::fallback::{FallbackTopic, topic_reply};
    use crate::transport::adapter::PushAdapter;
    use crate::transport::registry::OfferOutcome;
    use consult_types::config::{GenerationConfig, HealthConfig};
    use consult_types::llm::{GenerationError, GenerationRequest, GenerationResponse};
    use consult_types::transport::{ConnectionPhase, NegotiatorConfig, ServerFrame};
    use std::collections::HashMap;

    /// Echoes the latest user message after `delay`, or hangs forever.
    struct EchoBackend {
        delay: Duration,
        hang: bool,
    }

    impl GenerationBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GenerationResponse, GenerationError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.delay).await;
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(GenerationResponse {
                content: format!("re: {last}"),
                model: request.model.clone(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    type Orchestrator = ChatOrchestrator<InMemorySessionStore, InMemoryMessageLog>;

    fn orchestrator_with(backend: EchoBackend, timeout_ms: u64, grace: Duration) -> Arc<Orchestrator> {
        let synthesizer = ResponseSynthesizer::new(
            BoxGenerationBackend::new(backend),
            GenerationConfig {
                timeout_ms,
                max_message_chars: 50,
                ..GenerationConfig::default()
            },
        );
        Arc::new(ChatOrchestrator::new(
            InMemorySessionStore::new(),
            InMemoryMessageLog::new(),
            synthesizer,
            Arc::new(ConnectionRegistry::new(NegotiatorConfig::default())),
            Arc::new(HealthMonitor::new(&HealthConfig::default())),
            grace,
        ))
    }

    fn orchestrator() -> Arc<Orchestrator> {
        orchestrator_with(
            EchoBackend {
                delay: Duration::from_millis(10),
                hang: false,
            },
            1_000,
            Duration::from_millis(50),
        )
    }

    fn context(label: &str) -> SessionContext {
        SessionContext {
            label: label.to_string(),
            priority: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_follows_user_message() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("cost review")).await.unwrap();

        let ex = orch.handle_inbound(s.id, "alice", "What will this cost?").await.unwrap();

        assert_eq!(ex.user.sequence, 1);
        assert_eq!(ex.assistant.sequence, 2);
        assert_eq!(ex.assistant.role, MessageRole::Assistant);
        assert_eq!(ex.assistant.content, "re: What will this cost?");
    }

    #[tokio::test(start_paused = true)]
    async fn generation_timeout_appends_cost_fallback() {
        let orch = orchestrator_with(
            EchoBackend {
                delay: Duration::ZERO,
                hang: true,
            },
            200,
            Duration::from_secs(5),
        );
        let s = orch.create_session("alice", context("cost review")).await.unwrap();

        let ex = orch.handle_inbound(s.id, "alice", "What will this cost?").await.unwrap();

        assert_eq!(ex.assistant.sequence, 2);
        assert_eq!(ex.assistant.content, topic_reply(FallbackTopic::Cost));
        let snap = orch.health().snapshot(1, &HashMap::new());
        assert_eq!(snap.total_fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_fallback_then_pull_returns_full_history() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("cost review")).await.unwrap();
        orch.handle_inbound(s.id, "alice", "What will this cost?").await.unwrap();

        // Push attach times out for an auto client.
        let registry = orch.registry();
        registry
            .offer(s.id, RequestedMode::Auto, TransportMode::Push, 0)
            .unwrap();
        let t = registry.attach_failed(s.id, true).unwrap();
        assert!(t.fell_back);

        let history = orch
            .pull_since(s.id, "alice", RequestedMode::Auto, 0, 100)
            .await
            .unwrap();
        assert_eq!(history.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(registry.state(&s.id).unwrap().phase, ConnectionPhase::ConnectedPull);

        let stored = orch.authorize(s.id, "alice").await.unwrap();
        assert_eq!(stored.transport_mode, Some(TransportMode::Pull));
    }

    #[tokio::test(start_paused = true)]
    async fn forced_push_exhaustion_leaves_session_intact() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();
        orch.handle_inbound(s.id, "alice", "hello").await.unwrap();

        let registry = orch.registry();
        for _ in 0..3 {
            registry
                .offer(s.id, RequestedMode::Push, TransportMode::Push, 0)
                .unwrap();
            registry.attach_failed(s.id, false).unwrap();
        }
        let err = registry
            .offer(s.id, RequestedMode::Push, TransportMode::Push, 0)
            .unwrap_err();
        assert!(matches!(err, ChatError::Connectivity { attempts: 3, .. }));

        let session = orch.authorize(s.id, "alice").await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        let history = orch.history_page(s.id, "alice", Pagination::default()).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_messages_are_never_interleaved() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();

        let (first, second) = tokio::join!(
            orch.handle_inbound(s.id, "alice", "first"),
            orch.handle_inbound(s.id, "alice", "second"),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!((first.user.sequence, first.assistant.sequence), (1, 2));
        assert_eq!((second.user.sequence, second.assistant.sequence), (3, 4));
        assert_eq!(first.assistant.content, "re: first");
        assert_eq!(second.assistant.content, "re: second");
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_processed_in_parallel() {
        let orch = orchestrator_with(
            EchoBackend {
                delay: Duration::from_millis(500),
                hang: false,
            },
            5_000,
            Duration::from_secs(5),
        );
        let a = orch.create_session("alice", context("a")).await.unwrap();
        let b = orch.create_session("alice", context("b")).await.unwrap();
        let started = tokio::time::Instant::now();

        let (ra, rb) = tokio::join!(
            orch.handle_inbound(a.id, "alice", "one"),
            orch.handle_inbound(b.id, "alice", "two"),
        );
        ra.unwrap();
        rb.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn double_close_then_send_is_rejected() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();

        let first = orch.close_session(s.id, "alice").await.unwrap();
        let second = orch.close_session(s.id, "alice").await.unwrap();
        assert_eq!(first.status, SessionStatus::Closed);
        assert_eq!(first.closed_at, second.closed_at);

        let err = orch.handle_inbound(s.id, "alice", "still there?").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Validation(ValidationError::SessionClosed(id)) if id == s.id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn content_is_validated_before_queueing() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();

        assert!(matches!(
            orch.handle_inbound(s.id, "alice", "   ").await,
            Err(ChatError::Validation(ValidationError::EmptyContent))
        ));
        assert!(matches!(
            orch.handle_inbound(s.id, "alice", &"x".repeat(51)).await,
            Err(ChatError::Validation(ValidationError::ContentTooLong { max: 50 }))
        ));
        assert!(orch.log().recent(&s.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_principal_cannot_use_session() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();
        assert!(matches!(
            orch.handle_inbound(s.id, "mallory", "hi").await,
            Err(ChatError::Forbidden(_))
        ));
        assert!(matches!(
            orch.handle_inbound(Uuid::now_v7(), "alice", "hi").await,
            Err(ChatError::Validation(ValidationError::SessionNotFound(_)))
        ));
        assert!(orch.queues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn messages_accepted_before_close_still_complete() {
        let orch = orchestrator_with(
            EchoBackend {
                delay: Duration::from_millis(500),
                hang: false,
            },
            5_000,
            Duration::from_secs(5),
        );
        let s = orch.create_session("alice", context("x")).await.unwrap();

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.handle_inbound(s.id, "alice", "first").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.handle_inbound(s.id, "alice", "second").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch.close_session(s.id, "alice").await.unwrap();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!((first.user.sequence, first.assistant.sequence), (1, 2));
        assert_eq!((second.user.sequence, second.assistant.sequence), (3, 4));
        assert_eq!(second.assistant.content, "re: second");

        assert!(matches!(
            orch.handle_inbound(s.id, "alice", "third").await,
            Err(ChatError::Validation(ValidationError::SessionClosed(_)))
        ));
        assert_eq!(orch.log().recent(&s.id, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn pull_traffic_counts_as_activity() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();
        orch.sessions()
            .mark_idle_before(chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let polled = orch
            .pull_since(s.id, "alice", RequestedMode::Pull, 0, 10)
            .await
            .unwrap();
        assert!(polled.is_empty());

        let after = orch.authorize(s.id, "alice").await.unwrap();
        assert_eq!(after.status, SessionStatus::Active);
        assert!(after.last_activity_at > s.last_activity_at);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_outage_fails_explicitly_and_degrades_health() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();
        orch.log().set_available(false);

        let err = orch.handle_inbound(s.id, "alice", "hello").await.unwrap_err();
        assert!(err.is_storage());
        assert!(!orch.health().snapshot(1, &HashMap::new()).healthy);

        orch.log().set_available(true);
        assert!(orch.log().recent(&s.id, 10).await.unwrap().is_empty());
        assert!(orch.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_reactivated_by_message() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();
        orch.sessions()
            .mark_idle_before(chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        orch.handle_inbound(s.id, "alice", "back again").await.unwrap();
        let s = orch.authorize(s.id, "alice").await.unwrap();
        assert_eq!(s.status, SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn assistant_message_is_pushed_to_attached_client() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();
        let registry = orch.registry();
        let outcome = registry
            .offer(s.id, RequestedMode::Auto, TransportMode::Push, 0)
            .unwrap();
        assert_eq!(outcome, OfferOutcome::Proceed { resume_from: 0 });
        let (tx, mut rx) = mpsc::channel(8);
        registry
            .attach_succeeded(s.id, Arc::new(PushAdapter::new(tx, Duration::from_secs(1))))
            .unwrap();

        let ex = orch.handle_inbound(s.id, "alice", "ping").await.unwrap();

        assert_eq!(rx.recv().await, Some(ServerFrame::Message(ex.assistant)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_in_flight_generation_but_reply_is_kept() {
        let orch = orchestrator_with(
            EchoBackend {
                delay: Duration::ZERO,
                hang: true,
            },
            60_000,
            Duration::from_millis(100),
        );
        let s = orch.create_session("alice", context("x")).await.unwrap();

        let pending = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.handle_inbound(s.id, "alice", "what will this cost").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch.close_session(s.id, "alice").await.unwrap();

        let ex = pending.await.unwrap().unwrap();
        assert_eq!(ex.assistant.sequence, 2);
        assert_eq!(ex.assistant.content, topic_reply(FallbackTopic::Cost));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_still_gets_reply_stored() {
        let orch = orchestrator();
        let s = orch.create_session("alice", context("x")).await.unwrap();

        let fut = orch.handle_inbound(s.id, "alice", "fire and forget");
        // Poll once so the job is queued, then drop the caller.
        let _ = tokio::time::timeout(Duration::from_millis(1), fut).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let history = orch.log().recent(&s.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "re: fire and forget");
    }
}
