//! Connection Manager
//!
//! Consumes the listener's pending-connection queue, keeps a registry of live
//! connections for addressed writes, and funnels every connection's inbound
//! payloads through the [`MessageCodec`] into one application-facing queue.
//!
//! ```text
//!   Listener ──pending──► registration task ──► registry (DashMap)
//!                                │
//!                    per connection: run() + forward task
//!                                │
//!                                ▼
//!                  application queue (InboundMessage)
//! ```
//!
//! A connection is removed from the registry when its inbound queue closes,
//! which happens exactly once, from its close routine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::config::BusConfig;
use crate::message::{Message, MessageCodec, PassthroughCodec};
use crate::transport::{
    Connection, ConnectionId, ConnectionStats, Listener, ShutdownOutcome, TransportError,
};

type Registry = DashMap<ConnectionId, Arc<Connection>>;

/// A decoded message together with the connection it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender, usable as the address for a reply
    pub connection_id: ConnectionId,
    /// Decoded message
    pub message: Message,
}

/// Result of broadcasting a message
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Number of connections that accepted the message
    pub successful: usize,
    /// Number of connections that could not take the message
    pub failed: usize,
    /// IDs of connections that failed
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if all recipients accepted the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Channel ends that exist until `start()` hands them to the registration task
struct StartParts {
    pending_tx: mpsc::Sender<Arc<Connection>>,
    pending_rx: mpsc::Receiver<Arc<Connection>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

/// Registry of live connections and entry point for addressed writes
pub struct ConnectionManager {
    listener: Arc<Listener>,
    codec: Arc<dyn MessageCodec>,
    registry: Arc<Registry>,
    start_parts: Mutex<Option<StartParts>>,
    graceful_timeout: Duration,
}

impl ConnectionManager {
    /// Create a manager with the pass-through codec
    ///
    /// Returns the manager and the receiving end of the application queue.
    #[must_use]
    pub fn from_config(config: &BusConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        Self::new(config, Arc::new(PassthroughCodec))
    }

    /// Create a manager with a custom message codec
    ///
    /// Returns the manager and the receiving end of the application queue.
    /// The queue closes after `terminate()` once every connection is gone.
    #[must_use]
    pub fn new(
        config: &BusConfig,
        codec: Arc<dyn MessageCodec>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (pending_tx, pending_rx) = mpsc::channel(config.pending_backlog.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.application_queue_capacity.max(1));

        let manager = Self {
            listener: Arc::new(Listener::new(config)),
            codec,
            registry: Arc::new(DashMap::new()),
            start_parts: Mutex::new(Some(StartParts {
                pending_tx,
                pending_rx,
                inbound_tx,
            })),
            graceful_timeout: config.graceful_timeout(),
        };
        (manager, inbound_rx)
    }

    /// Path of the bus socket
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        self.listener.socket_path()
    }

    /// Bind the socket and start accepting and registering connections
    ///
    /// Must be called from within a Tokio runtime. Returns once the socket is
    /// bound; accepting continues in the background until `terminate()`.
    ///
    /// # Errors
    ///
    /// - `TransportError::Bind` if the socket cannot be bound
    /// - `TransportError::InvalidState` if already started or terminated
    pub fn start(&self) -> Result<(), TransportError> {
        let mut slot = self.start_parts.lock();
        let Some(parts) = slot.take() else {
            return Err(TransportError::InvalidState(
                "Connection manager already started or terminated".to_string(),
            ));
        };

        let bound = match self.listener.bind() {
            Ok(bound) => bound,
            Err(e) => {
                // Leave the manager startable so the caller may retry.
                *slot = Some(parts);
                return Err(e);
            }
        };
        drop(slot);

        let listener = Arc::clone(&self.listener);
        let pending_tx = parts.pending_tx;
        tokio::spawn(async move { listener.serve(bound, pending_tx).await });

        let registrar = Registrar {
            registry: Arc::clone(&self.registry),
            codec: Arc::clone(&self.codec),
            inbound_tx: parts.inbound_tx,
            cancel: self.listener.cancellation_token(),
        };
        tokio::spawn(registrar.run(parts.pending_rx));

        info!(path = ?self.listener.socket_path(), "Connection manager started");
        Ok(())
    }

    /// Stop accepting, close every connection and wait up to the graceful deadline
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the socket file cannot be removed.
    pub async fn terminate(&self) -> Result<ShutdownOutcome, TransportError> {
        // Never started: dropping the parts closes the application queue.
        drop(self.start_parts.lock().take());

        let outcome = self.listener.close(self.graceful_timeout).await?;
        info!(
            outcome = ?outcome,
            registered = self.registry.len(),
            "Connection manager terminated"
        );
        Ok(outcome)
    }

    /// Queue a message for one connection
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionNotFound` if no such connection is registered
    /// - `TransportError::ConnectionClosed` if it is closing
    /// - `TransportError::QueueFull` if its outbound queue is full
    /// - `TransportError::FrameTooLarge` if the encoded message is oversized
    pub fn write(&self, id: ConnectionId, message: &Message) -> Result<(), TransportError> {
        let connection = self
            .registry
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TransportError::ConnectionNotFound(id))?;

        connection.write(self.codec.encode(message))
    }

    /// Queue a message for every registered connection without blocking
    pub fn broadcast(&self, message: &Message) -> BroadcastResult {
        let payload = self.codec.encode(message);
        let targets: Vec<Arc<Connection>> = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut result = BroadcastResult::default();
        for connection in targets {
            match connection.write(payload.clone()) {
                Ok(()) => result.successful += 1,
                Err(e) => {
                    debug!(conn_id = %connection.id(), error = %e, "Broadcast write failed");
                    result.failed += 1;
                    result.failed_ids.push(connection.id());
                }
            }
        }
        result
    }

    /// Close one connection
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionNotFound` if it is not registered.
    pub fn disconnect(&self, id: ConnectionId) -> Result<(), TransportError> {
        let connection = self
            .registry
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TransportError::ConnectionNotFound(id))?;

        if connection.close() {
            info!(conn_id = %id, "Connection closed by application");
        }
        Ok(())
    }

    /// IDs of all registered connections
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.registry.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether a connection is registered
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.registry.contains_key(&id)
    }

    /// Statistics for every registered connection
    #[must_use]
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.registry
            .iter()
            .map(|entry| (*entry.key(), entry.value().stats()))
            .collect()
    }
}

/// State owned by the registration task
struct Registrar {
    registry: Arc<Registry>,
    codec: Arc<dyn MessageCodec>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
}

impl Registrar {
    async fn run(self, mut pending: mpsc::Receiver<Arc<Connection>>) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = pending.recv() => {
                    let Some(connection) = next else { break };
                    self.register(connection);
                }
            }
        }

        // Connections accepted but never registered still hold shutdown slots.
        pending.close();
        while let Ok(connection) = pending.try_recv() {
            connection.close();
        }
        debug!("Registration task finished");
    }

    fn register(&self, connection: Arc<Connection>) {
        let id = connection.id();
        let Some(inbound) = connection.take_inbound() else {
            warn!(conn_id = %id, "Connection inbound queue already taken, closing");
            connection.close();
            return;
        };

        self.registry.insert(id, Arc::clone(&connection));
        debug!(conn_id = %id, registered = self.registry.len(), "Connection registered");

        connection.spawn();

        let span = tracing::info_span!("connection", conn_id = %id);
        tokio::spawn(
            forward(
                id,
                inbound,
                Arc::clone(&self.codec),
                self.inbound_tx.clone(),
                self.cancel.clone(),
                Arc::clone(&self.registry),
            )
            .instrument(span),
        );
    }
}

/// Decode one connection's payloads into the application queue
async fn forward(
    id: ConnectionId,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    codec: Arc<dyn MessageCodec>,
    app_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    registry: Arc<Registry>,
) {
    while let Some(payload) = inbound.recv().await {
        let message = match codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "Failed to decode message, skipping");
                continue;
            }
        };

        let item = InboundMessage {
            connection_id: id,
            message,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = app_tx.send(item) => {
                if sent.is_err() {
                    trace!(conn_id = %id, "Application queue closed, discarding message");
                }
            }
        }
    }

    registry.remove(&id);
    debug!(conn_id = %id, registered = registry.len(), "Connection unregistered");
}
