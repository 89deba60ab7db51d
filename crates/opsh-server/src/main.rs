//! opsh-server: operator shell server.
//!
//! Runs pre-configured commands under a deadline and output cap, and hosts
//! shared PTY-backed shell sessions, both streamed to clients over
//! WebSocket.

mod config;
mod exec;
mod process;
mod server;
mod session;
mod store;
mod stream;
mod transport;

use clap::Parser;
use config::ServerConfig;
use exec::ExecutionEngine;
use server::OpshServer;
use session::TerminalSessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use store::{ConfigCommandStore, MemoryExecutionStore};
use tracing::{error, info};

/// opsh-server: operator shell server
#[derive(Parser, Debug)]
#[command(name = "opsh-server", version, about = "Operator shell server")]
struct Cli {
    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.opsh/config.toml")]
    config: String,

    /// Shell for terminal sessions
    #[arg(long)]
    shell: Option<String>,

    /// Maximum concurrent terminal sessions per user
    #[arg(long)]
    max_sessions_per_user: Option<usize>,

    /// Close terminal sessions idle for this many seconds
    #[arg(long)]
    idle_ttl: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting opsh-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.shell.as_deref(),
        cli.max_sessions_per_user,
        cli.idle_ttl,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let commands = ConfigCommandStore::new(server_config.commands.clone());
    info!(count = commands.len(), "loaded commands");

    let engine = Arc::new(ExecutionEngine::new(
        server_config.execution.clone(),
        Arc::new(commands),
        Arc::new(MemoryExecutionStore::new()),
    ));
    let terminals = Arc::new(TerminalSessionManager::new(server_config.terminal.clone()));
    let server = Arc::new(OpshServer::new(server_config, engine, terminals.clone()));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                terminals.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    terminals.shutdown().await;
    info!("opsh-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
