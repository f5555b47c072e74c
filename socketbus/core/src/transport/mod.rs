//! Transport Layer
//!
//! Local IPC over Unix domain sockets:
//! - [`frame`]: length-prefixed wire format with size and timeout limits
//! - [`connection`]: one accepted socket with its read and write loops
//! - [`listener`]: bind, accept and graceful shutdown
//! - [`client`]: client side used by tools and tests
//!
//! # Security
//!
//! - Socket files are created with 0600 permissions
//! - Peer credentials are read with `SO_PEERCRED` and the peer UID can be
//!   required to match the server's
//! - No network exposure

pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod listener;

// Re-exports for convenience
pub use client::BusClient;
pub use connection::{
    Connection, ConnectionId, ConnectionOptions, ConnectionState, ConnectionStats, PeerInfo,
};
pub use error::{FrameReadError, TransportError};
pub use frame::{encode, read_frame, write_frame, FrameDecoder, FrameLimits};
pub use listener::{Listener, ShutdownOutcome};
