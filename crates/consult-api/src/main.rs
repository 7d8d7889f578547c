//! Consultant chat service entry point.
//!
//! Binary name: `consultd`
//!
//! Parses CLI arguments, loads configuration, then starts the REST/WebSocket
//! server or runs a client-side command.

mod cli;
mod http;
mod state;

use std::path::PathBuf;

use clap::Parser;
use console::style;
use consult_infra::config::load_config_with_env;
use consult_infra::sqlite::api_key::create_api_key;
use consult_infra::sqlite::pool::default_data_dir;
use consult_observe::tracing_setup::{init_tracing, shutdown_tracing};
use consult_types::config::GlobalConfig;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands, KeyAction};
use state::AppState;

/// Principal that owns the key printed by `serve --ephemeral`.
const EPHEMERAL_PRINCIPAL: &str = "local";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_json, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state::config_path(&data_dir));
    let config = load_config_with_env(&config_path).await;

    match cli.command {
        Commands::Serve {
            host,
            port,
            ephemeral,
        } => serve(config, data_dir, host, port, ephemeral).await,

        Commands::Chat(args) => cli::chat::run_chat(args).await,

        Commands::Key {
            action: KeyAction::Create {
                principal,
                ttl_days,
            },
        } => cli::key::create_key(&config, &data_dir, &principal, ttl_days, cli.json).await,

        Commands::Config => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("# {}", config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
    }
}

async fn serve(
    mut config: GlobalConfig,
    data_dir: PathBuf,
    host: Option<String>,
    port: Option<u16>,
    ephemeral: bool,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // The scratch directory lives as long as the server; dropping it removes it.
    let (state, _scratch) = if ephemeral {
        let dir = tempfile::tempdir()?;
        config.server.database_url = None;
        let state = AppState::init(config, dir.path()).await?;
        let issued = create_api_key(&state.db_pool, EPHEMERAL_PRINCIPAL, None).await?;
        println!();
        println!(
            "  {} Ephemeral API key for '{}':",
            style("🔑").bold(),
            EPHEMERAL_PRINCIPAL
        );
        println!();
        println!("  {}", style(&issued.key).yellow().bold());
        println!();
        (state, Some(dir))
    } else {
        (AppState::init(config, &data_dir).await?, None)
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!(
        "  {} Consultant chat listening on {}",
        style("⚡").bold(),
        style(format!("http://{addr}")).cyan()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    let background = CancellationToken::new();
    let reaper = state.spawn_reaper(background.clone());

    let router = http::router::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.cancel();
    let _ = reaper.await;
    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
