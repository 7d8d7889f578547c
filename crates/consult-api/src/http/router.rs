//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Sessions
        .route(
            "/sessions",
            post(handlers::session::create_session).get(handlers::session::list_sessions),
        )
        .route(
            "/sessions/{id}",
            get(handlers::session::get_session)
                .put(handlers::session::update_session)
                .delete(handlers::session::close_session),
        )
        // Pull transport
        .route("/sessions/{id}/history", get(handlers::session::get_history))
        .route("/sessions/{id}/messages", post(handlers::message::send_message))
        // Push transport
        .route("/ws/chat", get(handlers::ws::ws_chat))
        // Negotiation settings and health
        .route("/chat/config", get(handlers::chat::get_config))
        .route("/chat/health", get(handlers::chat::get_health));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness check (no auth required).
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_core::llm::backend::GenerationBackend;
    use consult_core::llm::box_backend::BoxGenerationBackend;
    use consult_infra::sqlite::api_key::create_api_key;
    use consult_infra::sqlite::pool::DatabasePool;
    use consult_types::config::GlobalConfig;
    use consult_types::llm::{GenerationError, GenerationRequest, GenerationResponse};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::tungstenite::Message;

    /// Replies "re: <latest message>".
    struct EchoBackend;

    impl GenerationBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GenerationResponse, GenerationError> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(GenerationResponse {
                content: format!("re: {last}"),
                model: request.model.clone(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    struct TestServer {
        base: String,
        alice: String,
        bob: String,
    }

    async fn start_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url).await.unwrap();
        let alice = create_api_key(&pool, "alice", None).await.unwrap().key;
        let bob = create_api_key(&pool, "bob", None).await.unwrap().key;

        let state =
            AppState::from_parts(pool, GlobalConfig::default(), BoxGenerationBackend::new(EchoBackend));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        TestServer {
            base: format!("http://{addr}"),
            alice,
            bob,
        }
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("{}/api/v1{}", self.base, path)
        }

        fn ws_url(&self, key: &str) -> String {
            format!("{}/api/v1/ws/chat?token={key}", self.base.replace("http://", "ws://"))
        }

        async fn create_session(&self, label: &str) -> String {
            let resp = reqwest::Client::new()
                .post(self.url("/sessions"))
                .bearer_auth(&self.alice)
                .json(&json!({ "label": label }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 201);
            let body: Value = resp.json().await.unwrap();
            body["data"]["id"].as_str().unwrap().to_string()
        }

        async fn last_activity(&self, sid: &str) -> chrono::DateTime<chrono::Utc> {
            let body: Value = reqwest::Client::new()
                .get(self.url(&format!("/sessions/{sid}")))
                .bearer_auth(&self.alice)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            body["data"]["last_activity_at"].as_str().unwrap().parse().unwrap()
        }
    }

    async fn next_frame(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Close(_) => panic!("socket closed"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let server = start_server().await;
        let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_key() {
        let server = start_server().await;
        let resp = reqwest::get(server.url("/sessions")).await.unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "UNAUTHORIZED");

        let resp = reqwest::Client::new()
            .get(server.url("/sessions"))
            .header("x-api-key", "cnslt_wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_pull_exchange_and_close() {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let sid = server.create_session("cost review").await;

        let resp = client
            .post(server.url(&format!("/sessions/{sid}/messages")))
            .bearer_auth(&server.alice)
            .json(&json!({ "content": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["user"]["sequence"], 1);
        assert_eq!(body["data"]["assistant"]["sequence"], 2);
        assert_eq!(body["data"]["assistant"]["content"], "re: hello");

        let history: Value = client
            .get(server.url(&format!("/sessions/{sid}/history?since=0")))
            .bearer_auth(&server.alice)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history["data"].as_array().unwrap().len(), 2);

        let empty: Value = client
            .get(server.url(&format!("/sessions/{sid}/history?since=2")))
            .bearer_auth(&server.alice)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(empty["data"].as_array().unwrap().is_empty());

        for _ in 0..2 {
            let resp = client
                .delete(server.url(&format!("/sessions/{sid}")))
                .bearer_auth(&server.alice)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["data"]["status"], "closed");
        }

        let resp = client
            .post(server.url(&format!("/sessions/{sid}/messages")))
            .bearer_auth(&server.alice)
            .json(&json!({ "content": "still there?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn test_invalid_content_rejected() {
        let server = start_server().await;
        let sid = server.create_session("").await;
        let resp = reqwest::Client::new()
            .post(server.url(&format!("/sessions/{sid}/messages")))
            .bearer_auth(&server.alice)
            .json(&json!({ "content": "   " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "EMPTY_CONTENT");
    }

    #[tokio::test]
    async fn test_other_principal_gets_not_found() {
        let server = start_server().await;
        let sid = server.create_session("private").await;
        let resp = reqwest::Client::new()
            .get(server.url(&format!("/sessions/{sid}")))
            .bearer_auth(&server.bob)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "SESSION_NOT_FOUND");

        let listed: Value = reqwest::Client::new()
            .get(server.url("/sessions"))
            .bearer_auth(&server.bob)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(listed["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_uuid_is_validation_error() {
        let server = start_server().await;
        let resp = reqwest::Client::new()
            .get(server.url("/sessions/not-a-uuid"))
            .bearer_auth(&server.alice)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_chat_config_and_health() {
        let server = start_server().await;
        server.create_session("one").await;
        let client = reqwest::Client::new();

        let config: Value = client
            .get(server.url("/chat/config"))
            .bearer_auth(&server.alice)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(config["data"]["mode"], "auto");
        assert!(config["data"]["pushAttachTimeoutMs"].is_u64());

        let health: Value = client
            .get(server.url("/chat/health"))
            .bearer_auth(&server.alice)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["data"]["healthy"], true);
        assert_eq!(health["data"]["active_sessions"], 1);
    }

    #[tokio::test]
    async fn test_push_attach_and_exchange() {
        let server = start_server().await;
        let sid = server.create_session("push").await;

        let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&server.alice))
            .await
            .unwrap();
        let attach = json!({ "session_id": sid, "last_seq": 0 }).to_string();
        ws.send(Message::Text(attach)).await.unwrap();

        let attached = next_frame(&mut ws).await;
        assert_eq!(attached["attached"]["mode"], "push");
        assert_eq!(attached["attached"]["resume_from"], 0);

        ws.send(Message::Text(json!({ "content": "first" }).to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(json!({ "content": "second" }).to_string()))
            .await
            .unwrap();

        let first = next_frame(&mut ws).await;
        assert_eq!(first["message"]["sequence"], 2);
        assert_eq!(first["message"]["content"], "re: first");
        let second = next_frame(&mut ws).await;
        assert_eq!(second["message"]["sequence"], 4);
        assert_eq!(second["message"]["content"], "re: second");

        ws.send(Message::Text(json!({ "ack": 4 }).to_string()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_attach_and_ack_count_as_activity() {
        let server = start_server().await;
        let sid = server.create_session("quiet").await;
        let created = server.last_activity(&sid).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&server.alice))
            .await
            .unwrap();
        ws.send(Message::Text(json!({ "session_id": sid }).to_string()))
            .await
            .unwrap();
        assert!(next_frame(&mut ws).await.get("attached").is_some());
        let attached = server.last_activity(&sid).await;
        assert!(attached > created);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ws.send(Message::Text(json!({ "ack": 0 }).to_string()))
            .await
            .unwrap();
        let mut acked = attached;
        for _ in 0..50 {
            acked = server.last_activity(&sid).await;
            if acked > attached {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(acked > attached);
        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_offer_for_pull_session_redirects() {
        let server = start_server().await;
        let sid = server.create_session("pull only").await;

        let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&server.alice))
            .await
            .unwrap();
        let attach = json!({ "session_id": sid, "mode": "pull" }).to_string();
        ws.send(Message::Text(attach)).await.unwrap();

        let frame = next_frame(&mut ws).await;
        assert_eq!(frame["error"], "USE_PULL");
    }

    #[tokio::test]
    async fn test_push_attach_to_foreign_session_rejected() {
        let server = start_server().await;
        let sid = server.create_session("alice only").await;

        let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&server.bob))
            .await
            .unwrap();
        ws.send(Message::Text(json!({ "session_id": sid }).to_string()))
            .await
            .unwrap();

        let frame = next_frame(&mut ws).await;
        assert_eq!(frame["error"], "SESSION_NOT_FOUND");
    }
}
