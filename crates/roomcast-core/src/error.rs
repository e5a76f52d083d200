//! Error types for the roomcast core.
//!
//! The core never treats a protocol problem as fatal: malformed frames and bus
//! payloads are dropped at the boundary. These errors exist so the boundary
//! code can say *why* it dropped something, and so callers of
//! [`Multiplexer::publish`](crate::multiplexer::Multiplexer::publish) learn
//! that a reserved event name was refused.

use thiserror::Error;

/// Errors raised while decoding or encoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Inbound connection frame was not a valid envelope
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Inbound bus payload could not be decoded
    #[error("malformed payload on channel {channel}: {reason}")]
    MalformedBusPayload {
        /// Channel the payload arrived on
        channel: String,
        /// Decoder error
        reason: String,
    },

    /// Attempted to publish one of the transport's control events
    #[error("event name {0:?} is reserved for the transport")]
    ReservedEvent(String),

    /// Outbound value could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Returns true if the error came from untrusted inbound data.
    ///
    /// Inbound errors are dropped silently; outbound errors indicate a caller
    /// mistake.
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::MalformedEnvelope(_) | Self::MalformedBusPayload { .. })
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}
