//! [`TransportConnector`] for the terminal chat: WebSocket push attach and
//! HTTP pull attach against a running `consultd serve`.

use consult_core::transport::driver::TransportConnector;
use consult_types::chat::ChatMessage;
use consult_types::error::TransportError;
use consult_types::transport::{AttachRequest, RequestedMode, ServerFrame, TransportMode};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::client::ApiClient;
use crate::http::handlers::ws::USE_PULL;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An attached transport.
pub enum ChatConnection {
    /// Attached WebSocket; the `attached` frame has been consumed.
    Push(Box<WsStream>),
    /// Pull attach succeeded; holds the messages after the resume point.
    Pull(Vec<ChatMessage>),
}

pub struct ChatConnector {
    client: ApiClient,
    session_id: Uuid,
    requested: RequestedMode,
}

impl ChatConnector {
    pub fn new(client: ApiClient, session_id: Uuid, requested: RequestedMode) -> Self {
        Self {
            client,
            session_id,
            requested,
        }
    }

    async fn connect_push(&self, resume_from: u64) -> Result<WsStream, TransportError> {
        let mut request = self
            .client
            .ws_url()
            .into_client_request()
            .map_err(|e| TransportError::AttachFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.client.token()))
            .map_err(|e| TransportError::AttachFailed(e.to_string()))?;
        request.headers_mut().insert("authorization", auth);

        let (mut ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::AttachFailed(e.to_string()))?;

        let attach = AttachRequest {
            session_id: self.session_id,
            last_seq: resume_from,
            mode: self.requested,
        };
        let json = serde_json::to_string(&attach)
            .map_err(|e| TransportError::AttachFailed(e.to_string()))?;
        ws.send(Message::Text(json))
            .await
            .map_err(|_| TransportError::Disconnected)?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Attached { .. }) => Ok(ws),
                        Ok(ServerFrame::Error(code)) if code == USE_PULL => {
                            Err(TransportError::Redirected(TransportMode::Pull))
                        }
                        Ok(ServerFrame::Error(code)) => Err(TransportError::AttachFailed(code)),
                        Ok(ServerFrame::Message(_)) => Err(TransportError::AttachFailed(
                            "message before attach".to_string(),
                        )),
                        Err(e) => Err(TransportError::AttachFailed(e.to_string())),
                    };
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Disconnected),
                Some(Err(e)) => return Err(TransportError::AttachFailed(e.to_string())),
                Some(Ok(_)) => {}
            }
        }
    }

    async fn connect_pull(&self, resume_from: u64) -> Result<Vec<ChatMessage>, TransportError> {
        self.client
            .history_since(self.session_id, resume_from, self.requested)
            .await
            .map_err(|e| TransportError::AttachFailed(e.to_string()))
    }
}

impl TransportConnector for ChatConnector {
    type Connection = ChatConnection;

    async fn connect(
        &self,
        mode: TransportMode,
        resume_from: u64,
    ) -> Result<ChatConnection, TransportError> {
        match mode {
            TransportMode::Push => self
                .connect_push(resume_from)
                .await
                .map(|ws| ChatConnection::Push(Box::new(ws))),
            TransportMode::Pull => self.connect_pull(resume_from).await.map(ChatConnection::Pull),
        }
    }
}
