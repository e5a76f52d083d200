//! Server error types.

use std::fmt;

use crate::hub_error::HubError;

/// Errors that can occur in the server runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, bad flag values).
    ///
    /// Fatal at startup. Fix configuration and restart.
    Config(String),

    /// Transport/network error (listener failure, WebSocket handshake, I/O).
    ///
    /// May be transient (one bad client) or fatal (bind address in use).
    Transport(String),

    /// Protocol error (unencodable frame).
    ///
    /// Affects a single connection; the server keeps running.
    Protocol(String),

    /// Internal error (hub task gone, logic bug).
    ///
    /// Should never happen in a correct implementation.
    Internal(String),

    /// Error from the hub driver.
    Hub(HubError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Hub(err) => write!(f, "hub error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Hub(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        Self::Hub(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<roomcast_core::ProtocolError> for ServerError {
    fn from(err: roomcast_core::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
