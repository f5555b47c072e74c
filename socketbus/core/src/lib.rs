//! Socketbus Core - Local Message Bus over Unix Domain Sockets
//!
//! A server listens on a Unix socket, accepts client connections, frames
//! discrete messages with a length prefix, and hands decoded messages to the
//! application while allowing addressed replies back to specific connections.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   pending    ┌───────────────────┐   InboundMessage   ┌─────────────┐
//! │ Listener │ ───────────► │ ConnectionManager │ ─────────────────► │ Application │
//! │ (accept) │  Connection  │   (registry)      │ ◄───────────────── │             │
//! └──────────┘              └─────────┬─────────┘  write(id, msg)    └─────────────┘
//!                                     │
//!                    ┌────────────────┼────────────────┐
//!                    ▼                ▼                ▼
//!               Connection       Connection       Connection
//!              read + write     read + write     read + write
//! ```
//!
//! The listener never interprets messages; it only emits connections. The
//! manager owns the registry and the shared inbound queue. Each connection
//! runs an independent read loop and write loop with their own timeouts.
//!
//! # Key Types
//!
//! - [`ConnectionManager`]: start, terminate, addressed write, broadcast
//! - [`BusConfig`]: socket path, limits, timeouts and queue sizes
//! - [`Message`] / [`MessageCodec`]: application envelope and its codec
//! - [`transport::BusClient`]: client side of the bus
//!
//! # Quick Start
//!
//! ```ignore
//! use socketbus_core::{BusConfig, ConnectionManager, Message};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = socketbus_core::load_config(None)?;
//!     let (manager, mut inbound) = ConnectionManager::from_config(&config);
//!     manager.start()?;
//!
//!     while let Some(item) = inbound.recv().await {
//!         manager.write(item.connection_id, &item.message)?;
//!     }
//!
//!     manager.terminate().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: configuration file and environment loading
//! - [`message`]: application message envelope and codec
//! - [`manager`]: connection registry and application-facing queue
//! - [`transport`]: framing, connections, listener and client

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod manager;
pub mod message;
pub mod transport;

// Re-exports for convenience
pub use config::{
    default_config_path, default_socket_path, load_config, load_config_from_path, BusConfig,
    ConfigError,
};
pub use manager::{BroadcastResult, ConnectionManager, InboundMessage};
pub use message::{Message, MessageCodec, PassthroughCodec};
pub use transport::{
    BusClient, ConnectionId, ConnectionStats, ShutdownOutcome, TransportError,
};
