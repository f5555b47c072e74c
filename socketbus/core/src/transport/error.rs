//! Transport Errors
//!
//! One error type covers the whole transport. Variants fall into three
//! groups, and callers react to each group in a different way:
//!
//! - Startup: [`TransportError::Bind`] is fatal and surfaces to the caller.
//! - Connection-fatal: frame read/write faults end only the offending
//!   connection. They are logged with its identifier and never reach the
//!   listener or the manager as failures.
//! - Caller-recoverable: [`TransportError::QueueFull`],
//!   [`TransportError::ConnectionNotFound`] and
//!   [`TransportError::ConnectionClosed`] come back synchronously from a
//!   write, and the caller decides whether to retry or drop.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::connection::ConnectionId;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket path could not be prepared or bound
    #[error("Failed to bind Unix socket at {path:?}: {source}")]
    Bind {
        /// The socket path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Transient failure accepting a connection
    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    /// Declared or supplied payload exceeds the configured maximum
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Payload size in bytes
        size: u64,
        /// Configured maximum payload size
        max: usize,
    },

    /// Reading a frame failed (short read, IO error or timeout)
    #[error("Frame read failed: {0}")]
    FrameRead(#[source] FrameReadError),

    /// Writing or flushing a frame failed
    #[error("Frame write failed: {0}")]
    FrameWrite(#[source] std::io::Error),

    /// Peer closed the stream cleanly between frames
    #[error("Connection closed by peer")]
    ConnectionEof,

    /// Non-blocking enqueue found no capacity
    #[error("Outbound queue full for {0}")]
    QueueFull(ConnectionId),

    /// Addressed write to an unknown or just-closed connection
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Write attempted on a connection that is closing or closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Graceful drain exceeded its deadline
    #[error("Shutdown timed out after {elapsed:?} with {remaining} connection(s) still open")]
    ShutdownTimeout {
        /// How long the drain waited
        elapsed: Duration,
        /// Connections still open when the deadline passed
        remaining: usize,
    },

    /// Peer credentials did not satisfy the peer policy
    #[error("Peer rejected: {0}")]
    PeerRejected(String),

    /// Application-level message decode failed
    #[error("Message decode failed: {0}")]
    Decode(String),

    /// IO error from underlying transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Why reading a frame failed
#[derive(Debug, Error)]
pub enum FrameReadError {
    /// No frame started within the idle timeout
    #[error("idle timeout of {0:?} elapsed before next frame")]
    IdleTimeout(Duration),

    /// A started frame was not completed within the message timeout
    #[error("message timeout of {0:?} elapsed mid-frame")]
    MessageTimeout(Duration),

    /// Stream ended inside a frame
    #[error("stream ended after {read} of {expected} bytes")]
    Truncated {
        /// Bytes received before EOF
        read: usize,
        /// Bytes the frame required
        expected: usize,
    },

    /// Underlying IO error
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
