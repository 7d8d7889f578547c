//! Terminal chat client for `consultd chat`.
//!
//! Opens (or resumes) a session on a running server and negotiates a
//! transport with [`ClientNegotiation`]: WebSocket push first in `auto`
//! mode, falling back to HTTP polling. Lines read from stdin are sent as
//! messages; replies are printed once, in sequence order, and acknowledged.

pub mod client;
pub mod commands;
pub mod connector;

use std::time::Duration;

use consult_core::transport::driver::{ClientNegotiation, NegotiationError};
use consult_types::chat::{ChatMessage, MessageRole, SessionContext};
use consult_types::transport::{ClientFrame, RequestedMode, ServerFrame, TransportMode};
use console::style;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::client::{ApiClient, ClientError};
use self::commands::ChatCommand;
use self::connector::{ChatConnection, ChatConnector, WsStream};
use super::ChatArgs;

type Input = Lines<BufReader<Stdin>>;

/// Why a transport loop returned.
#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    /// The user left, or the session is gone.
    Quit,
    /// The transport dropped; renegotiate.
    Lost,
}

/// Mutable chat-loop context shared by both transports.
struct ChatContext {
    client: ApiClient,
    session_id: Uuid,
    requested: RequestedMode,
    poll_interval: Duration,
    negotiation: ClientNegotiation,
    mode: TransportMode,
}

impl ChatContext {
    fn acked(&self) -> u64 {
        self.negotiation.state().last_acked_sequence
    }

    /// Print `message` unless it was already shown. Returns whether it was new.
    fn show(&mut self, message: &ChatMessage) -> bool {
        if message.sequence <= self.acked() {
            return false;
        }
        render_message(message);
        self.negotiation.acknowledge(message.sequence);
        true
    }
}

pub async fn run_chat(args: ChatArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(&args.server, &args.token);
    let mut config = client.negotiator_config().await?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let session = match args.session {
        Some(id) => client.get_session(id).await?,
        None => {
            let context = SessionContext {
                label: args.label.clone(),
                priority: None,
            };
            client.create_session(&context).await?
        }
    };
    if session.is_closed() {
        anyhow::bail!("session {} is closed", session.id);
    }

    print_banner(&session.id, &session.context.label, config.mode);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let mut ctx = ChatContext {
        client: client.clone(),
        session_id: session.id,
        requested: config.mode,
        poll_interval: config.poll_interval(),
        negotiation: ClientNegotiation::new(config.clone(), session.id),
        mode: TransportMode::Push,
    };
    let connector = ChatConnector::new(client, session.id, config.mode);
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let connection = match ctx.negotiation.connect(&connector, &cancel).await {
            Ok((mode, connection)) => {
                ctx.mode = mode;
                println!("  {}", style(format!("connected via {mode}")).dim());
                connection
            }
            Err(NegotiationError::Cancelled) => break,
            Err(err) => {
                println!("  {} {err}", style("✗").red());
                return Err(err.into());
            }
        };

        let exit = match connection {
            ChatConnection::Push(ws) => push_loop(&mut ctx, *ws, &mut input, &cancel).await?,
            ChatConnection::Pull(backlog) => {
                for message in &backlog {
                    ctx.show(message);
                }
                pull_loop(&mut ctx, &mut input, &cancel).await?
            }
        };

        match exit {
            LoopExit::Quit => {
                ctx.negotiation.detach();
                break;
            }
            LoopExit::Lost => {
                println!("  {}", style("connection lost, reconnecting").yellow());
                ctx.negotiation.connection_lost()?;
            }
        }
    }

    println!();
    println!(
        "  {} Session {} left open",
        style("✓").green(),
        style(ctx.session_id).cyan()
    );
    Ok(())
}

/// What one line of input asks for.
enum Line {
    Send(String),
    Handled,
    Quit,
}

fn interpret(ctx: &ChatContext, line: Option<String>) -> Line {
    let Some(line) = line else {
        return Line::Quit;
    };
    match commands::parse(&line) {
        Some(ChatCommand::Exit) => Line::Quit,
        Some(ChatCommand::Help) => {
            commands::print_help();
            Line::Handled
        }
        Some(ChatCommand::Status) => {
            println!(
                "  {} {} (requested {}), last seen #{}",
                style("transport:").bold(),
                ctx.mode,
                ctx.requested,
                ctx.acked()
            );
            Line::Handled
        }
        Some(ChatCommand::Unknown(cmd)) => {
            println!("  {} unknown command {cmd}, try /help", style("?").yellow());
            Line::Handled
        }
        None if line.trim().is_empty() => Line::Handled,
        None => Line::Send(line),
    }
}

async fn push_loop(
    ctx: &mut ChatContext,
    mut ws: WsStream,
    input: &mut Input,
    cancel: &CancellationToken,
) -> anyhow::Result<LoopExit> {
    // No replay on attach: catch up on anything missed while away.
    match catch_up(ctx).await {
        Ok(()) => {}
        Err(err) if err.is_connectivity() => return Ok(LoopExit::Lost),
        Err(err) => return Err(err.into()),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(LoopExit::Quit);
            }
            line = input.next_line() => match interpret(ctx, line?) {
                Line::Send(content) => {
                    let frame = serde_json::to_string(&ClientFrame::Send { content })?;
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return Ok(LoopExit::Lost);
                    }
                }
                Line::Handled => {}
                Line::Quit => {
                    let _ = ws.close(None).await;
                    return Ok(LoopExit::Quit);
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Message(message)) => {
                        if ctx.show(&message) {
                            let ack = serde_json::to_string(&ClientFrame::Ack { ack: message.sequence })?;
                            if ws.send(Message::Text(ack)).await.is_err() {
                                return Ok(LoopExit::Lost);
                            }
                        }
                    }
                    Ok(ServerFrame::Error(code)) => {
                        render_error(&code);
                        if code == "SESSION_CLOSED" || code == "SESSION_NOT_FOUND" {
                            return Ok(LoopExit::Quit);
                        }
                    }
                    Ok(ServerFrame::Attached { .. }) => {}
                    Err(err) => tracing::debug!("Ignoring unreadable server frame: {err}"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Ok(LoopExit::Lost),
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn pull_loop(
    ctx: &mut ChatContext,
    input: &mut Input,
    cancel: &CancellationToken,
) -> anyhow::Result<LoopExit> {
    let mut poll = tokio::time::interval(ctx.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    poll.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(LoopExit::Quit),
            line = input.next_line() => match interpret(ctx, line?) {
                Line::Send(content) => {
                    match ctx.client.send_message(ctx.session_id, &content).await {
                        Ok(exchange) => {
                            // The user message is already on screen.
                            ctx.negotiation.acknowledge(exchange.user.sequence);
                            ctx.show(&exchange.assistant);
                        }
                        Err(err) => {
                            if let Some(exit) = classify(&err) {
                                return Ok(exit);
                            }
                        }
                    }
                }
                Line::Handled => {}
                Line::Quit => return Ok(LoopExit::Quit),
            },
            _ = poll.tick() => {
                if let Err(err) = catch_up(ctx).await {
                    if let Some(exit) = classify(&err) {
                        return Ok(exit);
                    }
                }
            }
        }
    }
}

/// Fetch and print everything after the last acknowledged sequence.
async fn catch_up(ctx: &mut ChatContext) -> Result<(), ClientError> {
    loop {
        let messages = ctx
            .client
            .history_since(ctx.session_id, ctx.acked(), ctx.requested)
            .await?;
        let mut progressed = false;
        for message in &messages {
            progressed |= ctx.show(message);
        }
        if !progressed {
            return Ok(());
        }
    }
}

/// Print a failed request. Returns how the loop should end, if it should.
fn classify(err: &ClientError) -> Option<LoopExit> {
    if err.is_connectivity() {
        return Some(LoopExit::Lost);
    }
    let code = err.code().unwrap_or("ERROR");
    render_error(code);
    matches!(code, "SESSION_CLOSED" | "SESSION_NOT_FOUND").then_some(LoopExit::Quit)
}

fn print_banner(session_id: &Uuid, label: &str, mode: RequestedMode) {
    println!();
    println!("  {}", style("Consultant chat").cyan().bold());
    if !label.is_empty() {
        println!("  {}", style(label).dim());
    }
    println!();
    println!("  {}  {}", style("Session:").bold(), style(session_id).dim());
    println!("  {}     {}", style("Mode:").bold(), style(mode).dim());
    println!();
    println!("  {}", style("Type /help for commands, Ctrl+D to exit").dim());
    println!("  {}", style("---").dim());
    println!();
}

fn render_message(message: &ChatMessage) {
    match message.role {
        MessageRole::Assistant => {
            println!();
            println!("  {} {}", style("consultant ›").cyan().bold(), message.content);
            println!();
        }
        MessageRole::User => {
            println!("  {} {}", style("you ›").dim(), style(&message.content).dim());
        }
    }
}

fn render_error(code: &str) {
    let hint = match code {
        "EMPTY_CONTENT" => "message is empty",
        "CONTENT_TOO_LONG" => "message is too long",
        "SESSION_CLOSED" => "this session has been closed",
        "SESSION_NOT_FOUND" => "session not found",
        "STORAGE_UNAVAILABLE" => "server storage is unavailable, try again shortly",
        _ => "request failed",
    };
    println!("  {} {hint} ({code})", style("✗").red());
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_types::transport::NegotiatorConfig;

    fn context() -> ChatContext {
        let session_id = Uuid::now_v7();
        ChatContext {
            client: ApiClient::new("http://127.0.0.1:1", "cnslt_test"),
            session_id,
            requested: RequestedMode::Auto,
            poll_interval: Duration::from_millis(100),
            negotiation: ClientNegotiation::new(NegotiatorConfig::default(), session_id),
            mode: TransportMode::Pull,
        }
    }

    fn message(ctx: &ChatContext, sequence: u64) -> ChatMessage {
        ChatMessage {
            id: Uuid::now_v7(),
            session_id: ctx.session_id,
            role: MessageRole::Assistant,
            content: format!("reply {sequence}"),
            sequence,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_messages_are_shown_once() {
        let mut ctx = context();
        let first = message(&ctx, 2);
        assert!(ctx.show(&first));
        assert!(!ctx.show(&first));
        assert!(!ctx.show(&message(&ctx, 1)));
        assert_eq!(ctx.acked(), 2);
    }

    #[test]
    fn test_interpret_lines() {
        let ctx = context();
        assert!(matches!(interpret(&ctx, None), Line::Quit));
        assert!(matches!(interpret(&ctx, Some("   ".to_string())), Line::Handled));
        assert!(matches!(interpret(&ctx, Some("/exit".to_string())), Line::Quit));
        assert!(matches!(
            interpret(&ctx, Some("hello".to_string())),
            Line::Send(s) if s == "hello"
        ));
    }

    #[test]
    fn test_closed_session_ends_loop() {
        let err = ClientError::Api {
            status: 409,
            code: "SESSION_CLOSED".to_string(),
            message: String::new(),
        };
        assert_eq!(classify(&err), Some(LoopExit::Quit));
        let err = ClientError::Api {
            status: 400,
            code: "EMPTY_CONTENT".to_string(),
            message: String::new(),
        };
        assert_eq!(classify(&err), None);
    }
}
