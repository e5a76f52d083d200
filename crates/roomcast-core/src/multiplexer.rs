//! Per-connection event demultiplexing and request/response correlation.
//!
//! A [`Multiplexer`] wraps one transport connection by composition. Inbound
//! frames are decoded as [`Envelope`]s and dispatched to every handler
//! registered for the envelope's event name, in registration order. The
//! control events `close` and `error` never travel as envelopes; handlers for
//! them are handed straight to the transport.

use std::collections::HashMap;

use serde_json::Value;

use crate::{
    envelope::{Envelope, ResponseEnvelope},
    error::ProtocolError,
    ids::ConnectionId,
};

/// Control events raised by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    /// Connection closed
    Close,
    /// Transport-level error
    Error,
}

impl ControlEvent {
    /// Map a reserved event name to its control event.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "close" => Some(Self::Close),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Reserved event name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Error => "error",
        }
    }
}

/// Handler for a control event. Receives the error text for
/// [`ControlEvent::Error`] and the close reason, if any, for
/// [`ControlEvent::Close`].
pub type ControlHandler = Box<dyn FnMut(Option<&str>) + Send>;

/// Handler for an application event.
pub type EventHandler<T> = Box<dyn FnMut(&Value, Option<Responder<T>>) + Send>;

/// The raw connection collaborator.
///
/// Implementations are cheap handles; cloning one must refer to the same
/// underlying connection. Writes are fire-and-forget.
pub trait Transport: Clone + Send + 'static {
    /// Write one text frame.
    fn send(&self, frame: String);

    /// Close the connection.
    fn close(&self);

    /// Register a handler for a transport control event.
    fn on_control(&self, event: ControlEvent, handler: ControlHandler);
}

/// Sends the response to one request.
///
/// Handed to each handler of an envelope carrying a request token.
#[derive(Debug, Clone)]
pub struct Responder<T> {
    transport: T,
    token: String,
}

impl<T: Transport> Responder<T> {
    /// Token of the request being answered.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Write `{eventName: "response-<token>", result}` to the connection.
    pub fn respond(self, result: Value) {
        match ResponseEnvelope::new(&self.token, result).encode() {
            Ok(frame) => self.transport.send(frame),
            Err(err) => tracing::warn!(token = %self.token, %err, "dropping unencodable response"),
        }
    }
}

/// Logical event streams over one connection.
pub struct Multiplexer<T> {
    id: ConnectionId,
    transport: T,
    handlers: HashMap<String, Vec<EventHandler<T>>>,
    closed: bool,
}

impl<T: Transport> Multiplexer<T> {
    /// Wrap a transport connection.
    pub fn new(id: ConnectionId, transport: T) -> Self {
        Self { id, transport, handlers: HashMap::new(), closed: false }
    }

    /// Connection this multiplexer serves.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Underlying transport handle.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register `handler` for `event_name`.
    ///
    /// Handlers for the same name run in registration order. `close` and
    /// `error` are forwarded to [`Transport::on_control`]; those handlers get
    /// the control detail as a JSON string (or `null`) and no responder.
    pub fn subscribe<F>(&mut self, event_name: &str, mut handler: F)
    where
        F: FnMut(&Value, Option<Responder<T>>) + Send + 'static,
    {
        if let Some(control) = ControlEvent::from_name(event_name) {
            self.transport.on_control(
                control,
                Box::new(move |detail| {
                    let data = detail.map_or(Value::Null, |text| Value::String(text.to_string()));
                    handler(&data, None);
                }),
            );
            return;
        }

        self.handlers.entry(event_name.to_string()).or_default().push(Box::new(handler));
    }

    /// Number of handlers registered for an application event.
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers.get(event_name).map_or(0, Vec::len)
    }

    /// Dispatch one inbound frame. Returns the number of handlers invoked.
    ///
    /// Malformed frames and events without handlers are dropped.
    pub fn handle_frame(&mut self, frame: &str) -> usize {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::trace!(connection = %self.id, %err, "dropping malformed frame");
                return 0;
            },
        };

        let token = envelope.token();
        let Some(handlers) = self.handlers.get_mut(&envelope.event_name) else {
            tracing::trace!(connection = %self.id, event = %envelope.event_name, "no handler");
            return 0;
        };

        for handler in handlers.iter_mut() {
            let responder = token
                .as_ref()
                .map(|token| Responder { transport: self.transport.clone(), token: token.clone() });
            handler(&envelope.data, responder);
        }
        handlers.len()
    }

    /// Write `{eventName, data}` to the connection.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ReservedEvent`] for `close` and `error`; nothing is
    /// written in that case.
    pub fn publish(&self, event_name: &str, data: Value) -> Result<(), ProtocolError> {
        if ControlEvent::from_name(event_name).is_some() {
            return Err(ProtocolError::ReservedEvent(event_name.to_string()));
        }
        let frame = Envelope::event(event_name, data).encode()?;
        self.transport.send(frame);
        Ok(())
    }

    /// Record that the connection closed.
    ///
    /// Returns `true` the first time only; cleanup keyed on this runs once
    /// however often the transport reports the close.
    pub fn handle_close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.handlers.clear();
        true
    }

    /// Whether [`Self::handle_close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> std::fmt::Debug for Multiplexer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.id)
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
