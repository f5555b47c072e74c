//! Unix Socket Client
//!
//! Client side of the bus. Connects to a listener's socket and exchanges
//! opaque payloads over the same length-prefixed framing the server uses.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use super::error::TransportError;
use super::frame::{encode, FrameDecoder, DEFAULT_MAX_MESSAGE_SIZE};

/// Capacity of the client's send and receive queues
const CLIENT_QUEUE_CAPACITY: usize = 100;

/// Read buffer size for the client's read task
const READ_BUFFER_SIZE: usize = 4096;

/// Client-side bus connection
///
/// Owns a read task that decodes frames into a receive queue and a write task
/// that frames queued payloads onto the socket.
pub struct BusClient {
    /// Path to the bus socket
    socket_path: PathBuf,
    max_message_size: usize,
    /// Payloads received from the bus
    msg_rx: Option<mpsc::Receiver<Vec<u8>>>,
    /// Payloads to send to the bus
    send_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Whether we're connected
    connected: Arc<AtomicBool>,
}

impl BusClient {
    /// Create a new client for the socket at `socket_path`
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            msg_rx: None,
            send_tx: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the largest payload this client sends or accepts
    #[must_use]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Get the socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connect to the bus and start the read and write tasks
    ///
    /// # Errors
    ///
    /// - `TransportError::InvalidState` if already connected
    /// - `TransportError::Io` if the socket cannot be reached
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("Already connected".to_string()));
        }

        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE_CAPACITY);
        let (send_tx, mut send_rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE_CAPACITY);

        self.connected.store(true, Ordering::SeqCst);

        // Read task: stream -> msg_tx
        let connected_read = Arc::clone(&self.connected);
        let max_message_size = self.max_message_size;
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(max_message_size);
            let mut buf = [0u8; READ_BUFFER_SIZE];

            'read: loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        tracing::debug!("Connection closed by server");
                        break;
                    }
                    Ok(n) => {
                        decoder.push(&buf[..n]);

                        loop {
                            match decoder.decode() {
                                Ok(Some(payload)) => {
                                    if msg_tx.send(payload).await.is_err() {
                                        tracing::debug!("Message receiver dropped");
                                        break 'read;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // The stream cannot be resynchronized.
                                    tracing::warn!(error = %e, "Frame decode error");
                                    break 'read;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            connected_read.store(false, Ordering::SeqCst);
            tracing::info!("Disconnected from bus");
        });

        // Write task: send_rx -> stream
        let connected_write = Arc::clone(&self.connected);
        tokio::spawn(async move {
            while let Some(payload) = send_rx.recv().await {
                let data = match encode(&payload, max_message_size) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(error = %e, "Encode error");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&data).await {
                    tracing::warn!(error = %e, "Write error");
                    break;
                }
            }

            connected_write.store(false, Ordering::SeqCst);
        });

        self.msg_rx = Some(msg_rx);
        self.send_tx = Some(send_tx);

        tracing::info!(path = ?self.socket_path, "Connected to bus");
        Ok(())
    }

    /// Drop both queues, which ends the write task and closes the socket
    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.msg_rx = None;
        self.send_tx = None;

        tracing::info!("Disconnected");
    }

    /// Queue a payload for sending
    ///
    /// # Errors
    ///
    /// - `TransportError::InvalidState` if not connected
    /// - `TransportError::FrameTooLarge` if the payload exceeds the maximum
    /// - `TransportError::ConnectionClosed` if the write task has stopped
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let payload = payload.into();
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("Not connected".to_string()));
        }
        if payload.len() > self.max_message_size {
            return Err(TransportError::FrameTooLarge {
                size: payload.len() as u64,
                max: self.max_message_size,
            });
        }

        let Some(tx) = self.send_tx.as_ref() else {
            return Err(TransportError::InvalidState("Not connected".to_string()));
        };
        tx.send(payload)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next payload from the bus
    ///
    /// # Errors
    ///
    /// - `TransportError::InvalidState` if never connected
    /// - `TransportError::ConnectionClosed` once the server side has closed
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.msg_rx.as_mut() {
            Some(rx) => rx.recv().await.ok_or(TransportError::ConnectionClosed),
            None => Err(TransportError::InvalidState("Not connected".to_string())),
        }
    }

    /// Take the next payload if one is already buffered
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.msg_rx.as_mut()?.try_recv().ok()
    }

    /// Whether both tasks are still running
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{read_frame, write_frame, FrameLimits};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_client_connect_no_server() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        let mut client = BusClient::new(socket_path);
        let result = client.connect().await;

        assert!(matches!(result, Err(TransportError::Io(_))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_client_roundtrip_against_raw_server() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let limits = FrameLimits::default();
            let request = read_frame(&mut stream, &limits).await.unwrap();
            write_frame(&mut stream, b"pong", &limits).await.unwrap();
            write_frame(&mut stream, b"", &limits).await.unwrap();
            request
        });

        let mut client = BusClient::new(socket_path);
        client.connect().await.unwrap();
        assert!(client.is_connected());

        client.send("ping").await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"pong");
        let empty = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(empty.is_empty());

        assert_eq!(server.await.unwrap(), b"ping");

        // Server task dropped its stream.
        let closed = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap();
        assert!(matches!(closed, Err(TransportError::ConnectionClosed)));

        client.disconnect();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_client_send_not_connected() {
        let client = BusClient::new("/nonexistent/bus.sock");
        let result = client.send("hello").await;
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_client_recv_not_connected() {
        let mut client = BusClient::new("/nonexistent/bus.sock");
        let result = client.recv().await;
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
        assert!(client.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_client_rejects_oversized_send() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _listener = UnixListener::bind(&socket_path).unwrap();

        let mut client = BusClient::new(socket_path).with_max_message_size(8);
        client.connect().await.unwrap();

        let result = client.send(vec![0u8; 9]).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }
}
