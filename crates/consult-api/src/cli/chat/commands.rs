//! Slash command parsing for the chat loop.

use console::style;

#[derive(Debug, PartialEq)]
pub enum ChatCommand {
    Help,
    /// Show transport and acknowledgement state.
    Status,
    Exit,
    Unknown(String),
}

/// Parse user input as a slash command.
///
/// Returns `None` if the input doesn't start with `/`.
pub fn parse(input: &str) -> Option<ChatCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let cmd = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match cmd.as_str() {
        "/help" | "/h" | "/?" => Some(ChatCommand::Help),
        "/status" => Some(ChatCommand::Status),
        "/exit" | "/quit" | "/q" => Some(ChatCommand::Exit),
        other => Some(ChatCommand::Unknown(other.to_string())),
    }
}

pub fn print_help() {
    println!();
    println!("  {}", style("Available commands:").bold());
    println!();
    println!("  {}    Show this help message", style("/help").cyan());
    println!("  {}  Show the transport in use", style("/status").cyan());
    println!("  {}    Leave the chat (the session stays open)", style("/exit").cyan());
    println!();
}
