//! Socketbus Daemon - Local Message Bus Server
//!
//! Serves the socketbus message bus on a Unix socket. Clients connect, send
//! length-prefixed frames, and may receive addressed replies.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! socketbus-daemon
//!
//! # Custom socket path
//! socketbus-daemon --socket-path /tmp/bus.sock
//!
//! # With config file
//! socketbus-daemon --config ~/.config/socketbus/socketbus.toml
//!
//! # Echo every message back to its sender
//! socketbus-daemon --echo
//!
//! # Verbose logging
//! RUST_LOG=debug socketbus-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use socketbus_core::{load_config, BusConfig, ShutdownOutcome};

use server::DaemonServer;

/// Socketbus Daemon - Local message bus over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "socketbus-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SOCKETBUS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SOCKETBUS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Largest accepted message payload in bytes
    #[arg(long, value_name = "BYTES")]
    max_message_size: Option<usize>,

    /// Graceful shutdown deadline in milliseconds
    #[arg(long, value_name = "MS")]
    graceful_timeout_ms: Option<u64>,

    /// Echo every received message back to its sender
    #[arg(long)]
    echo: bool,
}

impl Args {
    /// Load file and environment configuration, then apply CLI flags on top
    fn resolve_config(&self) -> Result<BusConfig> {
        let mut config = load_config(self.config.as_deref()).context("Failed to load configuration")?;

        if let Some(ref path) = self.socket_path {
            config.socket_path.clone_from(path);
        }
        if let Some(size) = self.max_message_size {
            config.max_message_size = size;
        }
        if let Some(ms) = self.graceful_timeout_ms {
            config.graceful_timeout_ms = ms;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "socketbus_daemon={level},socketbus_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Socketbus Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = args.resolve_config()?;
    info!(
        socket_path = ?config.socket_path,
        max_message_size = config.max_message_size,
        idle_timeout = ?config.idle_timeout(),
        message_timeout = ?config.message_timeout(),
        graceful_timeout = ?config.graceful_timeout(),
        "Configuration loaded"
    );

    // Install handlers before binding so an early signal is not lost
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
    };

    let server = DaemonServer::new(&config, args.echo);
    if let Err(e) = server.start() {
        error!(error = ?e, "Failed to start daemon");
        return Err(e);
    }

    match server.run(shutdown).await {
        Ok((ShutdownOutcome::Drained, _)) => {
            info!("Socketbus daemon stopped cleanly");
            Ok(())
        }
        Ok((ShutdownOutcome::TimedOut { remaining }, _)) => {
            info!(remaining, "Socketbus daemon stopped, abandoned open connections");
            Ok(())
        }
        Err(e) => {
            error!(error = ?e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_overrides_take_priority() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("socketbus.toml");
        std::fs::write(
            &config_path,
            "socket_path = \"/tmp/from-file.sock\"\nmax_message_size = 4096\npending_backlog = 7\n",
        )
        .unwrap();

        let args = Args::parse_from([
            "socketbus-daemon",
            "--config",
            config_path.to_str().unwrap(),
            "--socket-path",
            "/tmp/from-cli.sock",
            "--graceful-timeout-ms",
            "1500",
            "--echo",
        ]);
        assert!(args.echo);

        let config = args.resolve_config().unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/from-cli.sock"));
        assert_eq!(config.graceful_timeout_ms, 1500);
        assert_eq!(config.pending_backlog, 7);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");

        let args = Args::parse_from(["socketbus-daemon", "--config", missing.to_str().unwrap()]);
        assert!(args.resolve_config().is_err());
    }

    #[test]
    fn test_invalid_cli_value_is_rejected() {
        let args = Args::parse_from(["socketbus-daemon", "--max-message-size", "0"]);
        assert!(args.resolve_config().is_err());
    }
}
