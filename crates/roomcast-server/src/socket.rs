//! Application-facing view of one connection.
//!
//! Handlers run while the hub is busy dispatching, so they cannot call into it
//! directly. A [`SocketHandle`] instead queues [`Command`]s that the hub
//! applies as soon as the current dispatch returns. Every call is
//! fire-and-forget.

use roomcast_core::{ConnectionId, Multiplexer, ProtocolError, Responder, Transport};
use serde_json::Value;
use tokio::sync::mpsc;

/// Which of the two membership views a join or leave touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Room broadcast membership and presence count
    #[default]
    Both,
    /// Room broadcast membership only
    Room,
    /// Presence count only
    Presence,
}

impl Scope {
    pub(crate) fn rooms(self) -> bool {
        matches!(self, Self::Both | Self::Room)
    }

    pub(crate) fn presence(self) -> bool {
        matches!(self, Self::Both | Self::Presence)
    }
}

/// Work queued for the hub by socket handles.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Join a room
    Join {
        /// Connection joining
        connection: ConnectionId,
        /// Room name
        room: String,
        /// Views affected
        scope: Scope,
    },
    /// Leave a room
    Leave {
        /// Connection leaving
        connection: ConnectionId,
        /// Room name
        room: String,
        /// Views affected
        scope: Scope,
    },
    /// Leave every room
    LeaveAll {
        /// Connection leaving
        connection: ConnectionId,
        /// Views affected
        scope: Scope,
    },
    /// Deliver an event to every member of a room, on every instance
    Broadcast {
        /// Target room
        room: String,
        /// Event name
        event_name: String,
        /// Event payload
        data: Value,
    },
    /// Stream a room's presence count to the connection as `key` events
    SubscribePresence {
        /// Subscriber
        connection: ConnectionId,
        /// Watched room
        room: String,
        /// Event name used for the updates
        key: String,
    },
    /// Stop a presence stream
    UnsubscribePresence {
        /// Subscriber
        connection: ConnectionId,
        /// Watched room
        room: String,
        /// Event name used for the updates
        key: String,
    },
    /// Send an event to one connection
    Emit {
        /// Recipient
        connection: ConnectionId,
        /// Event name
        event_name: String,
        /// Event payload
        data: Value,
    },
    /// Close a connection
    Close {
        /// Connection to close
        connection: ConnectionId,
    },
}

/// Sender half of the hub's command queue.
pub type CommandSender = mpsc::UnboundedSender<Command>;

/// Cloneable, thread-safe handle to one connection's hub operations.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: ConnectionId,
    commands: CommandSender,
}

impl SocketHandle {
    pub(crate) fn new(id: ConnectionId, commands: CommandSender) -> Self {
        Self { id, commands }
    }

    /// Connection this handle refers to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::trace!(connection = %self.id, "hub gone, command dropped");
        }
    }

    /// Join `room` for broadcasts and presence.
    pub fn join(&self, room: &str) {
        self.join_scoped(room, Scope::Both);
    }

    /// Join `room` for the given views only.
    pub fn join_scoped(&self, room: &str, scope: Scope) {
        self.send(Command::Join { connection: self.id, room: room.to_string(), scope });
    }

    /// Leave `room` for broadcasts and presence.
    pub fn leave(&self, room: &str) {
        self.leave_scoped(room, Scope::Both);
    }

    /// Leave `room` for the given views only.
    pub fn leave_scoped(&self, room: &str, scope: Scope) {
        self.send(Command::Leave { connection: self.id, room: room.to_string(), scope });
    }

    /// Leave every room.
    pub fn leave_all(&self) {
        self.send(Command::LeaveAll { connection: self.id, scope: Scope::Both });
    }

    /// Broadcast to every member of `room` across instances.
    pub fn broadcast(&self, room: &str, event_name: &str, data: Value) {
        self.send(Command::Broadcast {
            room: room.to_string(),
            event_name: event_name.to_string(),
            data,
        });
    }

    /// Receive `room`'s presence count as `{eventName: key, data: count}`,
    /// starting with the current value. `key` defaults to the room name.
    pub fn subscribe_presence(&self, room: &str, key: Option<&str>) {
        self.send(Command::SubscribePresence {
            connection: self.id,
            room: room.to_string(),
            key: key.unwrap_or(room).to_string(),
        });
    }

    /// Stop a stream started by [`Self::subscribe_presence`].
    pub fn unsubscribe_presence(&self, room: &str, key: Option<&str>) {
        self.send(Command::UnsubscribePresence {
            connection: self.id,
            room: room.to_string(),
            key: key.unwrap_or(room).to_string(),
        });
    }

    /// Send an event to this connection.
    pub fn emit(&self, event_name: &str, data: Value) {
        self.send(Command::Emit { connection: self.id, event_name: event_name.to_string(), data });
    }

    /// Close this connection.
    pub fn close(&self) {
        self.send(Command::Close { connection: self.id });
    }
}

/// A connection during setup, handed to middleware and the connection
/// handler.
pub struct Socket<'a, T> {
    mux: &'a mut Multiplexer<T>,
    handle: SocketHandle,
}

impl<'a, T: Transport> Socket<'a, T> {
    pub(crate) fn new(mux: &'a mut Multiplexer<T>, handle: SocketHandle) -> Self {
        Self { mux, handle }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Handle for use inside event handlers.
    pub fn handle(&self) -> SocketHandle {
        self.handle.clone()
    }

    /// Register an event handler. `close` and `error` go to the transport.
    pub fn on<F>(&mut self, event_name: &str, handler: F)
    where
        F: FnMut(&Value, Option<Responder<T>>) + Send + 'static,
    {
        self.mux.subscribe(event_name, handler);
    }

    /// Send an event to this connection right away.
    pub fn emit(&self, event_name: &str, data: Value) -> Result<(), ProtocolError> {
        self.mux.publish(event_name, data)
    }
}

/// Outcome of a middleware step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next middleware
    Continue,
    /// Stop here; later middleware and the connection handler do not run
    Halt,
}

/// Per-connection setup step, run in registration order.
pub type Middleware<T> = Box<dyn FnMut(&mut Socket<'_, T>) -> Flow + Send>;

/// Final per-connection setup, run after all middleware continued.
pub type ConnectionHandler<T> = Box<dyn FnMut(&mut Socket<'_, T>) + Send>;
