//! Application Messages
//!
//! The envelope the manager hands to the application, and the codec that
//! converts between raw frame payloads and envelopes. The bus itself treats a
//! message as opaque bytes; [`PassthroughCodec`] keeps it that way. A higher
//! protocol layer plugs in its own [`MessageCodec`] to add message typing.

use std::fmt;

use crate::transport::TransportError;

/// Application-level envelope around one frame payload
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Message {
    payload: Vec<u8>,
}

impl Message {
    /// Wrap a payload
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Payload bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Consume the envelope and return the payload
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payloads can be large; show a bounded preview.
        const PREVIEW: usize = 32;
        let shown = &self.payload[..self.payload.len().min(PREVIEW)];
        f.debug_struct("Message")
            .field("len", &self.payload.len())
            .field("preview", &String::from_utf8_lossy(shown))
            .finish()
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&[u8]> for Message {
    fn from(payload: &[u8]) -> Self {
        Self::new(payload)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::new(text.into_bytes())
    }
}

impl From<Message> for Vec<u8> {
    fn from(message: Message) -> Self {
        message.into_bytes()
    }
}

/// Converts between raw payloads and application messages
///
/// A decode failure skips that one message; it never ends the connection.
pub trait MessageCodec: Send + Sync {
    /// Turn a received payload into a message
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Decode` if the payload is not a valid message.
    fn decode(&self, payload: Vec<u8>) -> Result<Message, TransportError>;

    /// Turn a message into a payload for sending
    fn encode(&self, message: &Message) -> Vec<u8>;
}

/// Codec that passes payload bytes through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl MessageCodec for PassthroughCodec {
    fn decode(&self, payload: Vec<u8>) -> Result<Message, TransportError> {
        Ok(Message::new(payload))
    }

    fn encode(&self, message: &Message) -> Vec<u8> {
        message.bytes().to_vec()
    }
}
