//! Frame Protocol
//!
//! Wire format for bus messages: a length prefix followed by an opaque payload.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+------------------------------------------+
//! | Length (4)     | Payload (Length bytes)                   |
//! | big-endian u32 | opaque bytes                             |
//! +----------------+------------------------------------------+
//! ```
//!
//! Frames are sent back-to-back with no delimiter.
//!
//! # Timeouts
//!
//! Reading a frame runs in two phases. The length prefix is awaited under the
//! idle timeout, which bounds how long a quiet connection may sit between
//! frames. Once a valid length is known, the payload must arrive within the
//! (shorter) message timeout, so a peer that starts a frame and trickles bytes
//! cannot hold the connection open. Writes are bounded by the message timeout.
//!
//! # Security
//!
//! - Maximum frame size is enforced before any payload buffer is allocated
//! - An oversized length is a protocol violation: no resynchronization is
//!   attempted and no payload bytes are consumed

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{FrameReadError, TransportError};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default idle timeout between frames (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default timeout for completing one started frame
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Minimum buffer capacity for the streaming decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Size and timing limits applied to every frame on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest accepted payload in bytes
    pub max_message_size: usize,
    /// Max wait for the start of the next frame
    pub idle_timeout: Duration,
    /// Max wait to finish receiving or sending one started frame
    pub message_timeout: Duration,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
        }
    }
}

fn check_size(size: usize, max: usize) -> Result<u32, TransportError> {
    match u32::try_from(size) {
        Ok(len) if size <= max => Ok(len),
        _ => Err(TransportError::FrameTooLarge {
            size: size as u64,
            max,
        }),
    }
}

/// Encode a payload to a length-prefixed frame
///
/// # Errors
///
/// Returns `TransportError::FrameTooLarge` if the payload exceeds `max_size`.
pub fn encode(payload: &[u8], max_size: usize) -> Result<Vec<u8>, TransportError> {
    let len = check_size(payload.len(), max_size)?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read until `buf` is full or the stream ends, returning bytes read
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one frame and return its payload
///
/// # Errors
///
/// - `TransportError::ConnectionEof` if the stream ended cleanly before a frame
/// - `TransportError::FrameTooLarge` if the declared length exceeds the maximum
/// - `TransportError::FrameRead` on timeouts, truncation or IO errors
pub async fn read_frame<R>(reader: &mut R, limits: &FrameLimits) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    let got = tokio::time::timeout(limits.idle_timeout, fill(reader, &mut header))
        .await
        .map_err(|_| TransportError::FrameRead(FrameReadError::IdleTimeout(limits.idle_timeout)))?
        .map_err(|e| TransportError::FrameRead(e.into()))?;

    if got == 0 {
        return Err(TransportError::ConnectionEof);
    }
    if got < LENGTH_PREFIX_SIZE {
        return Err(TransportError::FrameRead(FrameReadError::Truncated {
            read: got,
            expected: LENGTH_PREFIX_SIZE,
        }));
    }

    let declared = u32::from_be_bytes(header);
    let len = usize::try_from(declared).unwrap_or(usize::MAX);
    if len > limits.max_message_size {
        return Err(TransportError::FrameTooLarge {
            size: u64::from(declared),
            max: limits.max_message_size,
        });
    }

    let mut payload = vec![0u8; len];
    let got = tokio::time::timeout(limits.message_timeout, fill(reader, &mut payload))
        .await
        .map_err(|_| {
            TransportError::FrameRead(FrameReadError::MessageTimeout(limits.message_timeout))
        })?
        .map_err(|e| TransportError::FrameRead(e.into()))?;

    if got < len {
        return Err(TransportError::FrameRead(FrameReadError::Truncated {
            read: got,
            expected: len,
        }));
    }

    Ok(payload)
}

/// Write one frame and flush it
///
/// Nothing is written when the payload is oversized.
///
/// # Errors
///
/// - `TransportError::FrameTooLarge` if the payload exceeds the maximum
/// - `TransportError::FrameWrite` on IO errors or when the message timeout elapses
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    limits: &FrameLimits,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = check_size(payload.len(), limits.max_message_size)?;

    let send = async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };

    match tokio::time::timeout(limits.message_timeout, send).await {
        Ok(result) => result.map_err(TransportError::FrameWrite),
        Err(_) => Err(TransportError::FrameWrite(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("write not completed within {:?}", limits.message_timeout),
        ))),
    }
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete payloads. Used where the caller
/// owns a raw read loop instead of awaiting [`read_frame`].
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    max_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    /// Create a new decoder enforcing `max_size` on declared lengths
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_size,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::FrameTooLarge)` if the declared length is oversized
    pub fn decode(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let available = self.available();
        if available < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        header.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + LENGTH_PREFIX_SIZE]);
        let declared = u32::from_be_bytes(header);
        let len = usize::try_from(declared).unwrap_or(usize::MAX);

        if len > self.max_size {
            return Err(TransportError::FrameTooLarge {
                size: u64::from(declared),
                max: self.max_size,
            });
        }

        if available < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + LENGTH_PREFIX_SIZE;
        let payload_end = payload_start + len;
        let payload = self.buffer[payload_start..payload_end].to_vec();
        self.read_pos = payload_end;

        Ok(Some(payload))
    }
}
