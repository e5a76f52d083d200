//! Hub driver error types.

use std::fmt;

use roomcast_core::ConnectionId;

/// Errors raised while the hub processes an event.
///
/// None of these are fatal to the process; the runtime logs them and keeps
/// serving other connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Event referenced a connection the hub does not know.
    ///
    /// Usually a frame racing the connection's close. Transient.
    UnknownConnection(ConnectionId),

    /// A connection id was accepted twice.
    ///
    /// The runtime must assign unique ids. Indicates a bug.
    DuplicateConnection(ConnectionId),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownConnection(id) => write!(f, "unknown connection: {id}"),
            Self::DuplicateConnection(id) => write!(f, "connection already accepted: {id}"),
        }
    }
}

impl std::error::Error for HubError {}
