//! Unix Socket Listener
//!
//! Binds the bus socket, accepts connections and hands each one, wrapped in a
//! [`Connection`], to a bounded pending queue. The listener knows nothing
//! about messages; whoever drains the pending queue decides what a connection
//! is for.
//!
//! # Shutdown
//!
//! One [`CancellationToken`] is shared by the accept loop and, through child
//! tokens, by every connection it created. [`Listener::close`] cancels it and
//! then waits on a [`TaskTracker`] in which every live connection holds a
//! slot, up to a graceful deadline. Missing the deadline is logged, not
//! returned as an error. A closed listener cannot be restarted.
//!
//! # Security
//!
//! - Socket file is created with mode 0600
//! - Stale socket files are removed before binding
//! - Peers running as a different (non-root) user are rejected when
//!   `enforce_peer_uid` is set

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionOptions, PeerInfo};
use super::error::TransportError;
use crate::config::BusConfig;

/// First retry delay after a failed accept
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Cap on the backoff exponent (5ms << 6 = 320ms)
const ACCEPT_BACKOFF_MAX_SHIFT: u32 = 6;

/// How a graceful shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every connection finished before the deadline
    Drained,
    /// The deadline passed with connections still open
    TimedOut {
        /// Connections still holding a shutdown slot
        remaining: usize,
    },
}

/// Server side of the bus socket
#[derive(Debug)]
pub struct Listener {
    socket_path: PathBuf,
    options: ConnectionOptions,
    enforce_peer_uid: bool,
    cancel: CancellationToken,
    /// One slot per live connection
    connections: TaskTracker,
    /// One slot while the accept loop runs
    serving: TaskTracker,
    bound: AtomicBool,
}

impl Listener {
    /// Create a listener from bus configuration
    #[must_use]
    pub fn new(config: &BusConfig) -> Self {
        Self::with_options(config.socket_path.clone(), config.connection_options())
            .enforce_peer_uid(config.enforce_peer_uid)
    }

    /// Create a listener with explicit connection options
    #[must_use]
    pub fn with_options(socket_path: PathBuf, options: ConnectionOptions) -> Self {
        Self {
            socket_path,
            options,
            enforce_peer_uid: true,
            cancel: CancellationToken::new(),
            connections: TaskTracker::new(),
            serving: TaskTracker::new(),
            bound: AtomicBool::new(false),
        }
    }

    /// Set whether peers must run as the same user
    #[must_use]
    pub fn enforce_peer_uid(mut self, enforce: bool) -> Self {
        self.enforce_peer_uid = enforce;
        self
    }

    /// Get the socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Token cancelled when the listener starts closing
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of connections that have not finished closing
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Prepare the socket path and bind it
    ///
    /// Creates the parent directory if needed, removes a stale socket file
    /// and restricts the new socket to its owner.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Bind` if any of those steps fail.
    pub fn bind(&self) -> Result<UnixListener, TransportError> {
        let bind_error = |source| TransportError::Bind {
            path: self.socket_path.clone(),
            source,
        };

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(bind_error)?;
                debug!(path = ?parent, "Created socket directory");
            }
        }

        unlink(&self.socket_path).map_err(bind_error)?;

        let listener = UnixListener::bind(&self.socket_path).map_err(bind_error)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(bind_error)?;
        self.bound.store(true, Ordering::Release);

        info!(path = ?self.socket_path, "Listening on Unix socket");
        Ok(listener)
    }

    /// Bind the socket and run the accept loop until cancelled
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Bind` if the socket cannot be bound.
    pub async fn listen_and_serve(
        &self,
        pending: mpsc::Sender<Arc<Connection>>,
    ) -> Result<(), TransportError> {
        let listener = self.bind()?;
        self.serve(listener, pending).await;
        Ok(())
    }

    /// Run the accept loop on an already bound socket
    ///
    /// Each accepted stream becomes a [`Connection`] pushed onto `pending`.
    /// When `pending` is full this waits, so connections are accepted no
    /// faster than they are registered. Returns once cancelled or when the
    /// pending queue's receiver is gone, removing the socket file either way.
    pub async fn serve(&self, listener: UnixListener, pending: mpsc::Sender<Arc<Connection>>) {
        let _slot = self.serving.token();
        let mut consecutive_failures: u32 = 0;

        loop {
            let accepted = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("Cancellation requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _addr)) => {
                    consecutive_failures = 0;
                    stream
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let error = TransportError::Accept(e);
                    warn!(
                        error = %error,
                        attempt = consecutive_failures,
                        "Accept failed, will retry"
                    );

                    // Exponential backoff so a persistent failure does not spin.
                    let backoff = ACCEPT_BACKOFF_BASE
                        * (1u32 << consecutive_failures.min(ACCEPT_BACKOFF_MAX_SHIFT));
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            if let Err(e) = self.check_peer(&stream) {
                warn!(error = %e, "Rejecting connection");
                continue;
            }

            let connection = Connection::new(stream, self.options, &self.cancel, &self.connections);
            info!(
                conn_id = %connection.id(),
                peer = %connection.peer(),
                active_connections = self.connections.len(),
                "Accepted connection"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    connection.close();
                    info!("Cancellation requested, stopping accept loop");
                    break;
                }
                sent = pending.send(Arc::clone(&connection)) => {
                    if sent.is_err() {
                        connection.close();
                        warn!("Pending connection queue closed, stopping accept loop");
                        break;
                    }
                }
            }
        }

        drop(listener);
        if let Err(e) = self.remove_socket_file().await {
            warn!(path = ?self.socket_path, error = %e, "Failed to remove socket file");
        }
        debug!(path = ?self.socket_path, "Accept loop finished");
    }

    /// Unlink the socket file once, if this listener bound it
    async fn remove_socket_file(&self) -> std::io::Result<()> {
        if !self.bound.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => {
                debug!(path = ?self.socket_path, "Socket file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn check_peer(&self, stream: &UnixStream) -> Result<PeerInfo, TransportError> {
        let peer = PeerInfo::from_stream(stream);
        if !self.enforce_peer_uid {
            return Ok(peer);
        }

        let our_uid = unsafe { libc::getuid() };
        match peer.uid {
            Some(uid) if uid != our_uid && uid != 0 => Err(TransportError::PeerRejected(format!(
                "peer uid {uid} does not match server uid {our_uid}"
            ))),
            _ => Ok(peer),
        }
    }

    /// Stop accepting and drain connections within `graceful_timeout`
    ///
    /// Cancels the accept loop and every connection, waits for all of them to
    /// finish or for the deadline, then removes the socket file.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the socket file cannot be removed.
    pub async fn close(&self, graceful_timeout: Duration) -> Result<ShutdownOutcome, TransportError> {
        let started = Instant::now();
        info!(
            active_connections = self.connections.len(),
            timeout = ?graceful_timeout,
            "Closing listener"
        );

        self.cancel.cancel();
        self.serving.close();
        self.connections.close();

        let drained = tokio::time::timeout(graceful_timeout, async {
            self.serving.wait().await;
            self.connections.wait().await;
        })
        .await
        .is_ok();

        let outcome = if drained {
            info!(elapsed = ?started.elapsed(), "All connections finished");
            ShutdownOutcome::Drained
        } else {
            let remaining = self.connections.len();
            let error = TransportError::ShutdownTimeout {
                elapsed: started.elapsed(),
                remaining,
            };
            warn!(error = %error, "Graceful shutdown deadline passed, abandoning connections");
            ShutdownOutcome::TimedOut { remaining }
        };

        self.remove_socket_file().await?;
        Ok(outcome)
    }
}

/// Remove a socket file, tolerating its absence
fn unlink(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!(path = ?path, "Removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
