//! Connection
//!
//! Owns one accepted socket and the two tasks that service it.
//!
//! # Lifecycle
//!
//! ```text
//! Accepted ──run()──► Active ──first trigger──► Closing ──close routine──► Closed
//! ```
//!
//! Any of these triggers starts closing: the read loop hitting an error or
//! EOF, the write loop failing to send, or the listener's shared cancellation.
//! The close routine is guarded by the `closed` flag and runs its side effects
//! exactly once no matter how many triggers race.
//!
//! # Queues
//!
//! - Inbound: decoded payloads are offered with `try_send`. When the queue is
//!   full the payload is dropped and logged, so a slow consumer never stalls
//!   the read loop.
//! - Outbound: [`Connection::write`] never blocks. A full queue is reported as
//!   [`TransportError::QueueFull`] and the caller decides what to do.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use super::error::TransportError;
use super::frame::{self, FrameLimits};

/// Default per-connection queue capacity (inbound and outbound)
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

const STATE_ACCEPTED: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Unique identifier for a client connection
///
/// Generated from a random UUID when the connection is accepted and stable
/// for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Credentials of the process on the other end of the socket
///
/// Unix domain peers have no meaningful address, so the uid/pid pair stands
/// in as the remote address in logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer user id, if the platform reports it
    pub uid: Option<u32>,
    /// Peer process id, if the platform reports it
    pub pid: Option<i32>,
}

impl PeerInfo {
    /// Read peer credentials from a connected stream
    #[must_use]
    pub fn from_stream(stream: &UnixStream) -> Self {
        match stream.peer_cred() {
            Ok(cred) => Self {
                uid: Some(cred.uid()),
                pid: cred.pid(),
            },
            Err(e) => {
                debug!(error = %e, "Peer credentials unavailable");
                Self::default()
            }
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.uid, self.pid) {
            (Some(uid), Some(pid)) => write!(f, "uid={uid},pid={pid}"),
            (Some(uid), None) => write!(f, "uid={uid}"),
            _ => write!(f, "unknown"),
        }
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, loops not started
    Accepted,
    /// Read and write loops running
    Active,
    /// Close routine in progress
    Closing,
    /// Terminal
    Closed,
}

impl ConnectionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_ACCEPTED => Self::Accepted,
            STATE_ACTIVE => Self::Active,
            STATE_CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-connection tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Frame size and timeout limits
    pub limits: FrameLimits,
    /// Capacity of the inbound payload queue
    pub inbound_capacity: usize,
    /// Capacity of the outbound payload queue
    pub outbound_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            limits: FrameLimits::default(),
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Point-in-time statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Peer credentials
    pub peer: PeerInfo,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
    /// Frames decoded from the peer
    pub frames_received: u64,
    /// Frames written to the peer
    pub frames_sent: u64,
    /// Inbound frames dropped because the inbound queue was full
    pub frames_dropped: u64,
    /// Current lifecycle state
    pub state: ConnectionState,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// A live accepted socket plus its queues and lifecycle flag
pub struct Connection {
    id: ConnectionId,
    peer: PeerInfo,
    limits: FrameLimits,
    connected_at: Instant,
    /// Socket until `run()` splits it between the two loops
    stream: Mutex<Option<UnixStream>>,
    /// Child of the listener's cancellation; cancelling it closes the socket
    shutdown: CancellationToken,
    outbound_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    closed: AtomicBool,
    state: AtomicU8,
    /// Slot in the listener's shutdown wait, released by the close routine
    completion: Mutex<Option<TaskTrackerToken>>,
    counters: Counters,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Runs the close routine when dropped, including during a panic unwind
struct CloseGuard<'a>(&'a Connection);

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl Connection {
    /// Wrap an accepted stream
    ///
    /// The connection takes a slot in `tracker` that is released when it
    /// closes, and observes `cancel` through a child token.
    #[must_use]
    pub fn new(
        stream: UnixStream,
        options: ConnectionOptions,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let peer = PeerInfo::from_stream(&stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity.max(1));

        Arc::new(Self {
            id: ConnectionId::new(),
            peer,
            limits: options.limits,
            connected_at: Instant::now(),
            stream: Mutex::new(Some(stream)),
            shutdown: cancel.child_token(),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(STATE_ACCEPTED),
            completion: Mutex::new(Some(tracker.token())),
            counters: Counters::default(),
        })
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer credentials captured at accept time
    #[must_use]
    pub fn peer(&self) -> PeerInfo {
        self.peer
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Whether the close routine has started
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of this connection's counters
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connected_at: self.connected_at,
            peer: self.peer,
            uptime_secs: self.connected_at.elapsed().as_secs(),
            frames_received: self.counters.received.load(Ordering::Relaxed),
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    /// Take the receiving end of the inbound payload queue
    ///
    /// Returns `None` after the first call. The queue closes when the
    /// connection closes.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx.lock().take()
    }

    /// Queue a payload for sending without blocking
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionClosed` if the connection is closing or closed
    /// - `TransportError::FrameTooLarge` if the payload can never be framed
    /// - `TransportError::QueueFull` if the outbound queue has no capacity
    pub fn write(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        // Checked under the sender lock so nothing is queued once closing has
        // started, whether by the close routine or by cancellation.
        let guard = self.outbound_tx.lock();
        if self.is_closed() || self.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::ConnectionClosed);
        };

        if payload.len() > self.limits.max_message_size {
            return Err(TransportError::FrameTooLarge {
                size: payload.len() as u64,
                max: self.limits.max_message_size,
            });
        }

        tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull(self.id),
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    /// Service the connection until it terminates
    ///
    /// Spawns the write loop, then runs the read loop on the current task.
    /// The close routine runs on every exit path.
    pub async fn run(self: Arc<Self>) {
        let stream = self.stream.lock().take();
        let outbound = self.outbound_rx.lock().take();
        let (Some(stream), Some(outbound)) = (stream, outbound) else {
            debug!(conn_id = %self.id, "Connection already running or closed");
            return;
        };

        if self
            .state
            .compare_exchange(STATE_ACCEPTED, STATE_ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(conn_id = %self.id, "Connection closed before it started");
            return;
        }

        info!(conn_id = %self.id, peer = %self.peer, "Handling connection");

        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(
            Arc::clone(&self)
                .write_loop(write_half, outbound)
                .in_current_span(),
        );

        {
            let _guard = CloseGuard(&self);
            self.read_loop(read_half).await;
        }

        if let Err(e) = writer.await {
            warn!(conn_id = %self.id, error = %e, "Write loop task failed");
        }

        info!(conn_id = %self.id, peer = %self.peer, "Connection terminated");
    }

    async fn read_loop(&self, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);

        loop {
            let result = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!(conn_id = %self.id, "Read loop cancelled");
                    return;
                }
                result = frame::read_frame(&mut reader, &self.limits) => result,
            };

            match result {
                Ok(payload) => {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    trace!(conn_id = %self.id, len = payload.len(), "Received frame");
                    self.deliver(payload);
                }
                Err(TransportError::ConnectionEof) => {
                    info!(conn_id = %self.id, peer = %self.peer, "Connection closed by peer");
                    return;
                }
                Err(e) => {
                    warn!(
                        conn_id = %self.id,
                        peer = %self.peer,
                        error = %e,
                        "Failed to read frame, closing connection"
                    );
                    return;
                }
            }
        }
    }

    fn deliver(&self, payload: Vec<u8>) {
        let guard = self.inbound_tx.lock();
        let Some(tx) = guard.as_ref() else {
            trace!(conn_id = %self.id, "Inbound queue closed, discarding frame");
            return;
        };

        match tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conn_id = %self.id,
                    peer = %self.peer,
                    "Dropping inbound message, inbound queue is full"
                );
            }
            Err(TrySendError::Closed(_)) => {
                trace!(conn_id = %self.id, "Inbound receiver dropped, discarding frame");
            }
        }
    }

    async fn write_loop(self: Arc<Self>, write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<Vec<u8>>) {
        let mut writer = BufWriter::new(write_half);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!(conn_id = %self.id, "Write loop cancelled");
                    break;
                }
                next = outbound.recv() => {
                    let Some(payload) = next else {
                        debug!(conn_id = %self.id, "Outbound queue closed");
                        break;
                    };

                    // A write stuck on a peer that stopped reading must not
                    // outlive cancellation.
                    let written = tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => {
                            debug!(conn_id = %self.id, "Write loop cancelled mid-frame");
                            break;
                        }
                        written = frame::write_frame(&mut writer, &payload, &self.limits) => written,
                    };

                    if let Err(e) = written {
                        warn!(
                            conn_id = %self.id,
                            peer = %self.peer,
                            error = %e,
                            "Failed to write frame, closing connection"
                        );
                        // Unblocks the read loop, which then runs the close routine.
                        self.shutdown.cancel();
                        break;
                    }

                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    trace!(conn_id = %self.id, len = payload.len(), "Sent frame");
                }
            }
        }
    }

    /// Close the connection
    ///
    /// Closes both queues, closes the socket and releases the shutdown wait
    /// slot. Returns `true` for the call that performed the close; later and
    /// concurrent calls return `false` and do nothing.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.store(STATE_CLOSING, Ordering::Release);

        drop(self.outbound_tx.lock().take());
        drop(self.inbound_tx.lock().take());

        // Both loops select on this token and drop their socket halves.
        self.shutdown.cancel();
        drop(self.stream.lock().take());

        drop(self.completion.lock().take());
        self.state.store(STATE_CLOSED, Ordering::Release);

        debug!(conn_id = %self.id, "Connection closed");
        true
    }

    /// Spawn `run()` on the runtime inside a connection span
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!("connection", conn_id = %self.id);
        tokio::spawn(Arc::clone(self).run().instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options(inbound: usize, outbound: usize) -> ConnectionOptions {
        ConnectionOptions {
            limits: FrameLimits {
                max_message_size: 1024,
                idle_timeout: Duration::from_secs(5),
                message_timeout: Duration::from_secs(1),
            },
            inbound_capacity: inbound,
            outbound_capacity: outbound,
        }
    }

    fn pair(opts: ConnectionOptions) -> (Arc<Connection>, UnixStream, CancellationToken, TaskTracker) {
        let (server, client) = UnixStream::pair().unwrap();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let conn = Connection::new(server, opts, &cancel, &tracker);
        (conn, client, cancel, tracker)
    }

    async fn send_frame(client: &mut UnixStream, payload: &[u8]) {
        client
            .write_all(&frame::encode(payload, 1024).unwrap())
            .await
            .unwrap();
    }

    async fn wait_for_received(conn: &Connection, n: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while conn.stats().frames_received < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new();
        let formatted = format!("{id}");
        assert!(formatted.starts_with("conn-"));
        // conn- (5 chars) + UUID (36 chars)
        assert_eq!(formatted.len(), 41);
    }

    #[test]
    fn test_connection_id_unique() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn test_write_queue_full_does_not_block() {
        let (conn, _client, _cancel, _tracker) = pair(options(4, 2));

        conn.write(b"one".to_vec()).unwrap();
        conn.write(b"two".to_vec()).unwrap();

        let result = conn.write(b"three".to_vec());
        assert!(matches!(result, Err(TransportError::QueueFull(id)) if id == conn.id()));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (conn, _client, _cancel, tracker) = pair(options(4, 4));
        assert_eq!(tracker.len(), 1);

        assert!(conn.close());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.write(b"late".to_vec()),
            Err(TransportError::ConnectionClosed)
        ));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_write_oversized_rejected() {
        let (conn, _client, _cancel, _tracker) = pair(options(4, 4));
        let result = conn.write(vec![0u8; 1025]);
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_write_after_cancellation_fails() {
        let (conn, _client, cancel, _tracker) = pair(options(4, 4));

        // Cancelled but the close routine has not run yet.
        cancel.cancel();
        assert!(!conn.is_closed());
        assert!(matches!(
            conn.write(b"x".to_vec()),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_closed_takes_priority_over_size() {
        let (conn, _client, _cancel, _tracker) = pair(options(4, 4));
        conn.close();

        assert!(matches!(
            conn.write(vec![0u8; 1025]),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_close_runs_once() {
        let (conn, _client, _cancel, tracker) = pair(options(4, 4));
        let mut inbound = conn.take_inbound().unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let conn = Arc::clone(&conn);
            handles.push(tokio::spawn(async move { conn.close() }));
        }

        let mut performed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                performed += 1;
            }
        }

        assert_eq!(performed, 1);
        assert!(tracker.is_empty());
        assert!(inbound.recv().await.is_none(), "inbound queue should be closed");
    }

    #[tokio::test]
    async fn test_inbound_roundtrip_and_reply() {
        let (conn, mut client, _cancel, tracker) = pair(options(4, 4));
        let mut inbound = conn.take_inbound().unwrap();
        let handle = conn.spawn();

        send_frame(&mut client, b"hello").await;
        let received = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"hello");

        conn.write(b"world".to_vec()).unwrap();
        let mut wire = [0u8; 9];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&wire, b"\x00\x00\x00\x05world");

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_full_inbound_drops_and_keeps_reading() {
        let (conn, mut client, _cancel, _tracker) = pair(options(1, 4));
        let mut inbound = conn.take_inbound().unwrap();
        let _handle = conn.spawn();

        send_frame(&mut client, b"a").await;
        send_frame(&mut client, b"b").await;
        send_frame(&mut client, b"c").await;
        wait_for_received(&conn, 3).await;

        assert_eq!(inbound.recv().await.unwrap(), b"a");
        assert!(inbound.try_recv().is_err());
        assert_eq!(conn.stats().frames_dropped, 2);

        send_frame(&mut client, b"d").await;
        let next = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, b"d");
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_oversized_frame_terminates_connection() {
        let (conn, mut client, _cancel, tracker) = pair(options(4, 4));
        let handle = conn.spawn();

        client.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        assert!(tracker.is_empty());

        // Server side closed the socket.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_connection() {
        let (conn, _client, cancel, tracker) = pair(options(4, 4));
        let handle = conn.spawn();

        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_idle_peer_is_disconnected() {
        let mut opts = options(4, 4);
        opts.limits.idle_timeout = Duration::from_millis(100);
        let (conn, _client, _cancel, _tracker) = pair(opts);
        let handle = conn.spawn();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_run_after_close_is_noop() {
        let (conn, _client, _cancel, _tracker) = pair(options(4, 4));
        conn.close();

        tokio::time::timeout(Duration::from_secs(1), Arc::clone(&conn).run())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
