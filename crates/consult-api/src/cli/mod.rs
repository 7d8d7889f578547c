//! CLI command definitions for the `consultd` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod chat;
pub mod key;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use consult_types::transport::RequestedMode;
use uuid::Uuid;

/// Consultant chat server and terminal client.
#[derive(Parser)]
#[command(name = "consultd", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as one JSON object per line.
    #[arg(long, global = true, env = "CONSULT_LOG_JSON")]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "CONSULT_OTEL")]
    pub otel: bool,

    /// Directory holding config.toml and the database (default ~/.consult).
    #[arg(long, global = true, env = "CONSULT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Config file (default <data-dir>/config.toml).
    #[arg(long, global = true, env = "CONSULT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat server.
    Serve {
        /// Bind address (overrides [server] host).
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides [server] port).
        #[arg(short, long)]
        port: Option<u16>,

        /// Use a throwaway database and print a fresh API key.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Chat with the consultant from the terminal.
    Chat(ChatArgs),

    /// Manage API keys.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Print the effective configuration (file plus environment).
    Config,
}

#[derive(Args)]
pub struct ChatArgs {
    /// Server base URL.
    #[arg(long, env = "CONSULT_SERVER", default_value = "http://127.0.0.1:8340")]
    pub server: String,

    /// API key.
    #[arg(long, env = "CONSULT_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Resume an existing session instead of opening a new one.
    #[arg(long)]
    pub session: Option<Uuid>,

    /// Label for a new session.
    #[arg(long, default_value = "")]
    pub label: String,

    /// Transport: auto, push or pull (default: the server's setting).
    #[arg(long)]
    pub mode: Option<RequestedMode>,
}

#[derive(Subcommand)]
pub enum KeyAction {
    /// Issue a key for a principal. The key is shown once.
    Create {
        /// Principal the key authenticates as. Sessions are owned per principal.
        #[arg(long)]
        principal: String,

        /// Expire the key after this many days.
        #[arg(long)]
        ttl_days: Option<i64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_chat_mode_parses() {
        let cli = Cli::try_parse_from([
            "consultd", "chat", "--token", "cnslt_x", "--mode", "pull",
        ])
        .unwrap();
        match cli.command {
            Commands::Chat(args) => {
                assert_eq!(args.mode, Some(RequestedMode::Pull));
                assert_eq!(args.server, "http://127.0.0.1:8340");
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from(["consultd", "serve", "-p", "9000", "--ephemeral"]).unwrap();
        match cli.command {
            Commands::Serve { port, ephemeral, host } => {
                assert_eq!(port, Some(9000));
                assert!(ephemeral);
                assert!(host.is_none());
            }
            _ => panic!("expected serve"),
        }
    }
}
