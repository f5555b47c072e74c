//! Daemon Server Implementation
//!
//! The application loop for the socketbus daemon:
//! - Starts the `ConnectionManager` on the configured socket
//! - Consumes the shared inbound queue and logs every message
//! - Optionally echoes each payload back to its sender
//! - Terminates the bus when the shutdown future resolves
//!
//! ```text
//!     client ──frame──► ConnectionManager ──InboundMessage──► DaemonServer
//!        ▲                                                      │
//!        └────────────── write(conn_id, msg) ◄──── (--echo) ────┘
//! ```

use std::future::Future;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use socketbus_core::{
    BusConfig, ConnectionManager, InboundMessage, ShutdownOutcome, TransportError,
};

/// Counters reported when the daemon stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Messages taken from the inbound queue
    pub messages_received: u64,
    /// Echo replies queued successfully
    pub replies_sent: u64,
    /// Echo replies that could not be queued
    pub replies_failed: u64,
}

/// The main daemon server
pub struct DaemonServer {
    manager: ConnectionManager,
    inbound: mpsc::Receiver<InboundMessage>,
    echo: bool,
    stats: ServerStats,
}

impl DaemonServer {
    /// Create a daemon server for `config`
    pub fn new(config: &BusConfig, echo: bool) -> Self {
        let (manager, inbound) = ConnectionManager::from_config(config);
        Self {
            manager,
            inbound,
            echo,
            stats: ServerStats::default(),
        }
    }

    /// Bind the socket and begin accepting connections
    pub fn start(&self) -> Result<()> {
        self.manager.start().with_context(|| {
            format!(
                "Failed to start message bus on {:?}",
                self.manager.socket_path()
            )
        })?;
        info!(path = ?self.manager.socket_path(), echo = self.echo, "Daemon server started");
        Ok(())
    }

    /// Run the application loop until `shutdown` resolves, then terminate the bus
    pub async fn run<F>(mut self, shutdown: F) -> Result<(ShutdownOutcome, ServerStats)>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                next = self.inbound.recv() => {
                    let Some(item) = next else {
                        warn!("Inbound queue closed unexpectedly");
                        break;
                    };
                    self.handle(item);
                }
            }
        }

        let outcome = self
            .manager
            .terminate()
            .await
            .context("Failed to terminate message bus")?;

        info!(
            outcome = ?outcome,
            messages_received = self.stats.messages_received,
            replies_sent = self.stats.replies_sent,
            replies_failed = self.stats.replies_failed,
            "Daemon server stopped"
        );
        Ok((outcome, self.stats))
    }

    fn handle(&mut self, item: InboundMessage) {
        self.stats.messages_received += 1;
        debug!(
            conn_id = %item.connection_id,
            len = item.message.len(),
            "Received message"
        );

        if !self.echo {
            return;
        }

        match self.manager.write(item.connection_id, &item.message) {
            Ok(()) => self.stats.replies_sent += 1,
            // Sender went away before the reply; nothing to alarm about.
            Err(TransportError::ConnectionNotFound(id)) => {
                self.stats.replies_failed += 1;
                debug!(conn_id = %id, "Echo target already disconnected");
            }
            Err(e) => {
                self.stats.replies_failed += 1;
                warn!(conn_id = %item.connection_id, error = %e, "Failed to queue echo reply");
            }
        }
    }
}
