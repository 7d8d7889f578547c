//! WebSocket push channel for chat sessions.
//!
//! `GET /api/v1/ws/chat` upgrades to a WebSocket. The client's first text
//! frame must be an [`AttachRequest`]; the server answers with
//! `{"attached": {...}}` or `{"error": CODE}` and closes. Once attached:
//!
//! - `{"content": "..."}` frames are queued on the session in receipt order.
//!   Replies arrive as `{"message": ChatMessage}` frames.
//! - `{"ack": N}` frames record the highest sequence the client has seen.
//!
//! Attaching and acknowledging both count as session activity.
//!
//! There is no backlog replay on attach: `resume_from` tells the client
//! where to resume reading history. A dropped socket does not abort queued
//! messages; their replies stay in the log.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use consult_core::transport::adapter::{PushAdapter, TransportAdapter};
use consult_core::transport::registry::OfferOutcome;
use consult_types::transport::{AttachRequest, ClientFrame, ServerFrame, TransportMode};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::state::{AppState, ConcreteOrchestrator};

/// Error code telling a client this session must use the pull transport.
pub const USE_PULL: &str = "USE_PULL";

/// Outbound frames buffered per connection before sends start waiting.
const OUTBOUND_CAPACITY: usize = 64;

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// How the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The client sent a Close frame.
    Detached,
    /// The socket failed, ended, or the adapter was closed under us.
    Lost,
}

/// Upgrade to the chat push channel. Mounted at `/ws/chat`.
pub async fn ws_chat(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, principal.id))
}

async fn handle_chat_socket(socket: WebSocket, state: AppState, principal: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let orchestrator = state.orchestrator.clone();
    let registry = orchestrator.registry().clone();

    let timeout = registry.config().push_attach_timeout();
    let request = match tokio::time::timeout(timeout, read_attach_request(&mut ws_receiver)).await {
        Ok(Ok(request)) => request,
        Ok(Err(code)) => {
            reject(&mut ws_sender, code).await;
            return;
        }
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "No attach request before timeout");
            reject(&mut ws_sender, "ATTACH_TIMEOUT").await;
            return;
        }
    };
    let session_id = request.session_id;

    match orchestrator.authorize(session_id, &principal).await {
        Ok(session) if session.is_closed() => {
            reject(&mut ws_sender, "SESSION_CLOSED").await;
            return;
        }
        Ok(_) => {}
        Err(err) => {
            reject(&mut ws_sender, AppError::from(err).code()).await;
            return;
        }
    }

    let resume_from =
        match registry.offer(session_id, request.mode, TransportMode::Push, request.last_seq) {
            Ok(OfferOutcome::Proceed { resume_from }) => resume_from,
            Ok(OfferOutcome::Redirect(mode)) => {
                debug!(%session_id, %mode, "Redirecting push client");
                reject(&mut ws_sender, USE_PULL).await;
                return;
            }
            Err(err) => {
                reject(&mut ws_sender, AppError::from(err).code()).await;
                return;
            }
        };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    // A delivery may wait on a full buffer as long as an attach may take.
    let adapter = Arc::new(PushAdapter::new(outbound_tx, timeout));
    let closed = adapter.closed();

    if let Err(err) = registry.attach_succeeded(session_id, adapter.clone()) {
        warn!(%session_id, error = %err, "Push attach failed");
        let _ = registry.attach_failed(session_id, false);
        reject(&mut ws_sender, AppError::from(err).code()).await;
        return;
    }

    orchestrator.touch(session_id).await;

    let writer = tokio::spawn(write_frames(ws_sender, outbound_rx, closed.clone()));
    let attached = ServerFrame::Attached {
        session_id,
        mode: TransportMode::Push,
        resume_from,
    };
    if adapter.send_frame(attached).await.is_err() {
        registry.connection_lost(session_id, adapter.id());
        let _ = writer.await;
        return;
    }
    if let Err(err) = orchestrator.record_transport(session_id, TransportMode::Push).await {
        warn!(%session_id, error = %err, "Failed to record transport mode");
    }

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(forward_inbound(
        orchestrator.clone(),
        session_id,
        principal,
        adapter.clone(),
        inbound_rx,
    ));

    let exit = loop {
        tokio::select! {
            _ = closed.cancelled() => break Exit::Lost,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Send { content }) => {
                        // The forwarder outlives the socket, so this only fails after shutdown.
                        let _ = inbound_tx.send(content);
                    }
                    Ok(ClientFrame::Ack { ack }) => {
                        registry.acknowledge(session_id, ack);
                        orchestrator.touch(session_id).await;
                    }
                    Err(err) => {
                        debug!(%session_id, "Ignoring malformed client frame: {err}");
                        let _ = adapter
                            .send_frame(ServerFrame::Error("VALIDATION_ERROR".to_string()))
                            .await;
                    }
                },
                Some(Ok(Message::Close(_))) => break Exit::Detached,
                None => break Exit::Lost,
                Some(Err(err)) => {
                    debug!(%session_id, "WebSocket receive error: {err}");
                    break Exit::Lost;
                }
                // Binary, ping and pong frames are handled by axum.
                Some(Ok(_)) => {}
            }
        }
    };

    match exit {
        Exit::Detached => registry.detach(session_id, adapter.id()),
        Exit::Lost => {
            // No-op when the adapter was superseded or the session closed.
            registry.connection_lost(session_id, adapter.id());
        }
    }
    adapter.close();
    orchestrator.client_disconnected(session_id);

    // Queued messages are still processed; their replies land in history.
    drop(inbound_tx);
    let _ = writer.await;
    info!(%session_id, ?exit, "Push connection ended");
}

/// Wait for the first text frame and parse it as an [`AttachRequest`].
async fn read_attach_request(receiver: &mut WsReceiver) -> Result<AttachRequest, &'static str> {
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).map_err(|err| {
                    debug!("Invalid attach request: {err}");
                    "VALIDATION_ERROR"
                });
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err("DISCONNECTED"),
            Some(Ok(_)) => {}
        }
    }
}

/// Send `{"error": code}` and close the socket.
async fn reject(sender: &mut WsSender, code: &str) {
    if let Ok(json) = serde_json::to_string(&ServerFrame::Error(code.to_string())) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Drain the adapter's outbound queue onto the socket until it closes.
async fn write_frames(
    mut sender: WsSender,
    mut outbound: mpsc::Receiver<ServerFrame>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!("Failed to serialize server frame: {err}");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    // Marks the adapter closed when the socket failed first.
    closed.cancel();
    let _ = sender.send(Message::Close(None)).await;
}

/// Hand inbound contents to the orchestrator one at a time, in receipt order.
async fn forward_inbound(
    orchestrator: Arc<ConcreteOrchestrator>,
    session_id: Uuid,
    principal: String,
    adapter: Arc<PushAdapter>,
    mut inbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(content) = inbound.recv().await {
        if let Err(err) = orchestrator
            .handle_inbound(session_id, &principal, &content)
            .await
        {
            let code = AppError::from(err).code();
            debug!(%session_id, code, "Inbound message rejected");
            let _ = adapter.send_frame(ServerFrame::Error(code.to_string())).await;
        }
    }
}
