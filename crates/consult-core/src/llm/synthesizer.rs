//! ResponseSynthesizer: always produces a non-empty assistant reply.
//!
//! The backend call runs under the generation timeout and races the
//! per-message cancellation token. Any error, timeout, cancellation or
//! blank output goes through [`ResponseSynthesizer::fallback`], the one
//! place a keyword reply is chosen.

use consult_types::chat::{ChatMessage, ChatSession, MessageRole};
use consult_types::config::GenerationConfig;
use consult_types::llm::{GenerationError, GenerationRequest, PromptMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::box_backend::BoxGenerationBackend;
use super::fallback::{FallbackTopic, fallback_reply};

/// Where a synthesized reply came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySource {
    Backend,
    Fallback {
        topic: Option<FallbackTopic>,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Synthesized {
    pub content: String,
    pub source: ReplySource,
}

impl Synthesized {
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, ReplySource::Fallback { .. })
    }
}

pub struct ResponseSynthesizer {
    backend: BoxGenerationBackend,
    config: GenerationConfig,
}

impl ResponseSynthesizer {
    pub fn new(backend: BoxGenerationBackend, config: GenerationConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Produce a reply to `history` (ascending, ending with the user message).
    pub async fn synthesize(
        &self,
        session: &ChatSession,
        history: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Synthesized {
        let latest_user = history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let request = self.build_request(session, history);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            r = tokio::time::timeout(self.config.timeout(), self.backend.generate(&request)) => {
                match r {
                    Ok(r) => r,
                    Err(_) => Err(GenerationError::Timeout(self.config.timeout_ms)),
                }
            }
        };

        match outcome {
            Ok(response) if !response.content.trim().is_empty() => {
                debug!(
                    session_id = %session.id,
                    backend = self.backend.name(),
                    output_tokens = response.output_tokens,
                    "Generated reply"
                );
                Synthesized {
                    content: response.content.trim().to_string(),
                    source: ReplySource::Backend,
                }
            }
            Ok(_) => self.fallback(session, latest_user, GenerationError::EmptyContent),
            Err(err) => self.fallback(session, latest_user, err),
        }
    }

    /// The fallback branch: keyword reply for the latest user message.
    pub fn fallback(
        &self,
        session: &ChatSession,
        latest_user: &str,
        reason: GenerationError,
    ) -> Synthesized {
        let reply = fallback_reply(latest_user);
        warn!(
            session_id = %session.id,
            backend = self.backend.name(),
            reason = %reason,
            topic = ?reply.topic,
            "Generation failed, using fallback reply"
        );
        Synthesized {
            content: reply.content.to_string(),
            source: ReplySource::Fallback {
                topic: reply.topic,
                reason: reason.to_string(),
            },
        }
    }

    /// One request: system framing from the session context, then history
    /// mapped onto user/assistant turns.
    pub fn build_request(&self, session: &ChatSession, history: &[ChatMessage]) -> GenerationRequest {
        let start = history.len().saturating_sub(self.config.history_window);
        let messages = history[start..]
            .iter()
            .map(|m| PromptMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        GenerationRequest {
            model: self.config.model.clone(),
            system: Some(system_prompt(session)),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: Some(self.config.temperature),
        }
    }
}

fn system_prompt(session: &ChatSession) -> String {
    let mut prompt = String::from(
        "You are a senior technology consultant chatting with a prospective client. \
         Answer concisely and practically, ask a clarifying question when the request \
         is ambiguous, and never invent prices or commitments.",
    );
    let label = session.context.label.trim();
    if !label.is_empty() {
        prompt.push_str(&format!("\n\nConversation topic: {label}."));
    }
    if let Some(priority) = session.context.priority {
        prompt.push_str(&format!("\nClient priority: {priority}."));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::backend::GenerationBackend;
    use crate::llm::fallback::topic_reply;
    use chrono::Utc;
    use consult_types::chat::{Priority, SessionContext};
    use consult_types::llm::GenerationResponse;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    enum Behaviour {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct FakeBackend {
        behaviour: Behaviour,
        last_request: Mutex<Option<GenerationRequest>>,
    }

    impl FakeBackend {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                last_request: Mutex::new(None),
            }
        }
    }

    impl GenerationBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GenerationResponse, GenerationError> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            match self.behaviour {
                Behaviour::Reply(text) => Ok(GenerationResponse {
                    content: text.to_string(),
                    model: request.model.clone(),
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                Behaviour::Fail => Err(GenerationError::Status { status: 502 }),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn session() -> ChatSession {
        ChatSession::new(
            "alice",
            SessionContext {
                label: "cost review".to_string(),
                priority: Some(Priority::High),
            },
        )
    }

    fn user(session_id: Uuid, seq: u64, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::now_v7(),
            session_id,
            role: if seq % 2 == 1 { MessageRole::User } else { MessageRole::Assistant },
            content: content.to_string(),
            sequence: seq,
            created_at: Utc::now(),
        }
    }

    fn synthesizer(behaviour: Behaviour) -> ResponseSynthesizer {
        ResponseSynthesizer::new(
            BoxGenerationBackend::new(FakeBackend::new(behaviour)),
            GenerationConfig {
                timeout_ms: 200,
                history_window: 3,
                ..GenerationConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn backend_reply_is_used_and_trimmed() {
        let s = session();
        let synth = synthesizer(Behaviour::Reply("  Roughly two sprints.  "));
        let out = synth
            .synthesize(&s, &[user(s.id, 1, "What will this cost?")], &CancellationToken::new())
            .await;
        assert_eq!(out.source, ReplySource::Backend);
        assert_eq!(out.content, "Roughly two sprints.");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_goes_to_cost_fallback() {
        let s = session();
        let synth = synthesizer(Behaviour::Hang);
        let out = synth
            .synthesize(&s, &[user(s.id, 1, "What will this cost?")], &CancellationToken::new())
            .await;
        assert!(out.is_fallback());
        assert_eq!(out.content, topic_reply(FallbackTopic::Cost));
        match out.source {
            ReplySource::Fallback { topic, reason } => {
                assert_eq!(topic, Some(FallbackTopic::Cost));
                assert!(reason.contains("timed out"));
            }
            ReplySource::Backend => panic!("expected fallback"),
        }
    }

    #[tokio::test]
    async fn blank_output_goes_to_fallback() {
        let s = session();
        let synth = synthesizer(Behaviour::Reply("   \n"));
        let out = synth
            .synthesize(&s, &[user(s.id, 1, "hello")], &CancellationToken::new())
            .await;
        assert!(out.is_fallback());
        assert!(!out.content.trim().is_empty());
    }

    #[tokio::test]
    async fn backend_error_goes_to_fallback() {
        let s = session();
        let synth = synthesizer(Behaviour::Fail);
        let out = synth
            .synthesize(&s, &[user(s.id, 1, "is it secure?")], &CancellationToken::new())
            .await;
        assert_eq!(out.content, topic_reply(FallbackTopic::Security));
    }

    #[tokio::test]
    async fn cancellation_still_yields_reply() {
        let s = session();
        let synth = synthesizer(Behaviour::Hang);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = synth
            .synthesize(&s, &[user(s.id, 1, "What will this cost?")], &cancel)
            .await;
        match out.source {
            ReplySource::Fallback { reason, .. } => assert!(reason.contains("cancelled")),
            ReplySource::Backend => panic!("expected fallback"),
        }
    }

    #[test]
    fn request_frames_context_and_bounds_history() {
        let s = session();
        let synth = synthesizer(Behaviour::Fail);
        let history: Vec<ChatMessage> = (1..=5).map(|i| user(s.id, i, &format!("m{i}"))).collect();

        let req = synth.build_request(&s, &history);
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].content, "m3");
        assert_eq!(req.messages[2].role, MessageRole::User);
        let system = req.system.unwrap();
        assert!(system.contains("cost review"));
        assert!(system.contains("high"));
    }

    #[tokio::test]
    async fn fallback_uses_latest_user_message() {
        let s = session();
        let synth = synthesizer(Behaviour::Fail);
        let history = vec![
            user(s.id, 1, "what will this cost"),
            user(s.id, 2, "It depends."),
            user(s.id, 3, "how do we migrate?"),
        ];
        let out = synth.synthesize(&s, &history, &CancellationToken::new()).await;
        assert_eq!(out.content, topic_reply(FallbackTopic::Migration));
    }
}
