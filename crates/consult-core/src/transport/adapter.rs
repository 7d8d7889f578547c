//! Transport adapters: one interface for push and pull delivery.
//!
//! The orchestrator hands every assistant message to whichever adapter is
//! active for the session and never branches on the transport itself.
//!
//! - [`PushAdapter`] forwards frames into the WebSocket writer task through a
//!   bounded channel. Sending waits for capacity, bounded by a timeout.
//! - [`PullAdapter`] is a no-op sink: pull clients fetch new messages with
//!   `list_since` on their next request.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use consult_types::chat::ChatMessage;
use consult_types::error::TransportError;
use consult_types::transport::{ServerFrame, TransportMode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`TransportAdapter::deliver`].
pub type DeliverFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

static NEXT_ADAPTER_ID: AtomicU64 = AtomicU64::new(1);

fn next_adapter_id() -> u64 {
    NEXT_ADAPTER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Object-safe delivery interface shared by both transports.
pub trait TransportAdapter: Send + Sync {
    /// Unique per adapter instance; lets the registry ignore stale disconnects.
    fn id(&self) -> u64;

    fn mode(&self) -> TransportMode;

    /// Deliver one appended message to the client.
    fn deliver<'a>(&'a self, message: &'a ChatMessage) -> DeliverFuture<'a>;

    fn is_open(&self) -> bool;

    /// Detach this adapter. Called when it is superseded or the session closes.
    fn close(&self);
}

/// Push delivery over a long-lived duplex channel.
///
/// Owns the sending half of the connection's outbound queue. The socket
/// task holds the receiver and watches [`PushAdapter::closed`] so that a
/// superseded adapter shuts its socket down.
pub struct PushAdapter {
    id: u64,
    outbound: mpsc::Sender<ServerFrame>,
    closed: CancellationToken,
    send_timeout: Duration,
}

impl PushAdapter {
    pub fn new(outbound: mpsc::Sender<ServerFrame>, send_timeout: Duration) -> Self {
        Self {
            id: next_adapter_id(),
            outbound,
            closed: CancellationToken::new(),
            send_timeout,
        }
    }

    /// Token cancelled when this adapter is closed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Queue an arbitrary frame (attach acknowledgements, errors).
    pub async fn send_frame(&self, frame: ServerFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Disconnected);
        }
        match tokio::time::timeout(self.send_timeout, self.outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => Err(TransportError::SendTimedOut),
        }
    }
}

impl TransportAdapter for PushAdapter {
    fn id(&self) -> u64 {
        self.id
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Push
    }

    fn deliver<'a>(&'a self, message: &'a ChatMessage) -> DeliverFuture<'a> {
        Box::pin(self.send_frame(ServerFrame::Message(message.clone())))
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Stateless pull delivery.
pub struct PullAdapter {
    id: u64,
    open: AtomicBool,
}

impl PullAdapter {
    pub fn new() -> Self {
        Self {
            id: next_adapter_id(),
            open: AtomicBool::new(true),
        }
    }
}

impl Default for PullAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportAdapter for PullAdapter {
    fn id(&self) -> u64 {
        self.id
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Pull
    }

    fn deliver<'a>(&'a self, _message: &'a ChatMessage) -> DeliverFuture<'a> {
        // The next pull request picks the message up via list_since.
        Box::pin(async { Ok(()) })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use consult_types::chat::MessageRole;
    use uuid::Uuid;

    fn message(seq: u64) -> ChatMessage {
        ChatMessage {
            id: Uuid::now_v7(),
            session_id: Uuid::now_v7(),
            role: MessageRole::Assistant,
            content: "hello".to_string(),
            sequence: seq,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn push_adapter_forwards_message_frames() {
        let (tx, mut rx) = mpsc::channel(4);
        let adapter = PushAdapter::new(tx, Duration::from_secs(1));
        let msg = message(2);

        adapter.deliver(&msg).await.unwrap();

        assert_eq!(rx.recv().await, Some(ServerFrame::Message(msg)));
    }

    #[tokio::test]
    async fn push_adapter_reports_disconnect_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let adapter = PushAdapter::new(tx, Duration::from_secs(1));
        drop(rx);

        assert!(!adapter.is_open());
        let err = adapter.deliver(&message(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn push_adapter_send_times_out_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let adapter = PushAdapter::new(tx, Duration::from_millis(50));
        adapter.deliver(&message(1)).await.unwrap();

        let err = adapter.deliver(&message(2)).await.unwrap_err();
        assert!(matches!(err, TransportError::SendTimedOut));
    }

    #[tokio::test]
    async fn closed_push_adapter_signals_socket_task() {
        let (tx, _rx) = mpsc::channel(1);
        let adapter = PushAdapter::new(tx, Duration::from_secs(1));
        let token = adapter.closed();
        adapter.close();
        assert!(token.is_cancelled());
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn pull_adapter_delivery_is_a_noop() {
        let adapter = PullAdapter::new();
        assert_eq!(adapter.mode(), TransportMode::Pull);
        adapter.deliver(&message(1)).await.unwrap();
        adapter.close();
        assert!(!adapter.is_open());
    }

    #[test]
    fn adapter_ids_are_unique() {
        let a = PullAdapter::new();
        let b = PullAdapter::new();
        assert_ne!(a.id(), b.id());
    }
}
