//! WebSocket transport implementation.
//!
//! Each accepted socket is split into a reader loop and a writer task. The
//! hub never touches the socket: it holds a [`WsConnection`], whose writes go
//! through an unbounded channel to the writer task, so they never block the
//! hub.
//!
//! Control handlers (`close`, `error`) registered through
//! [`Transport::on_control`] are stored here. The reader loop only reports the
//! socket's end as hub events; the hub task fires the handlers when it
//! dispatches those events, after every frame that arrived before them.

use std::sync::{Arc, Mutex, PoisonError};

use roomcast_core::{ConnectionId, ControlEvent, ControlHandler, Transport};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct Controls {
    close: Vec<ControlHandler>,
    error: Vec<ControlHandler>,
}

/// Hub-side handle to one WebSocket connection.
#[derive(Clone)]
pub struct WsConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
    controls: Arc<Mutex<Controls>>,
}

impl WsConnection {
    /// Create a handle whose writes land on `outbound`.
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, outbound, controls: Arc::new(Mutex::new(Controls::default())) }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run the handlers registered for `event`.
    ///
    /// Handlers are taken out of the lock before they run, so a handler may
    /// register further handlers without deadlocking. Each fires at most
    /// once.
    pub fn fire(&self, event: ControlEvent, detail: Option<&str>) {
        let handlers = {
            let mut controls = self.controls.lock().unwrap_or_else(PoisonError::into_inner);
            match event {
                ControlEvent::Close => std::mem::take(&mut controls.close),
                ControlEvent::Error => std::mem::take(&mut controls.error),
            }
        };

        for mut handler in handlers {
            handler(detail);
        }
    }

    fn push(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            tracing::trace!(connection = %self.id, "writer gone, frame dropped");
        }
    }
}

impl Transport for WsConnection {
    fn send(&self, frame: String) {
        self.push(Message::text(frame));
    }

    fn close(&self) {
        self.push(Message::Close(None));
    }

    fn on_control(&self, event: ControlEvent, handler: ControlHandler) {
        let mut controls = self.controls.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            ControlEvent::Close => controls.close.push(handler),
            ControlEvent::Error => controls.error.push(handler),
        }
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_go_to_the_writer_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new(ConnectionId(1), tx);

        conn.send("{\"eventName\":\"x\"}".to_string());
        conn.close();

        assert_eq!(rx.try_recv().unwrap(), Message::text("{\"eventName\":\"x\"}"));
        assert_eq!(rx.try_recv().unwrap(), Message::Close(None));
    }

    #[test]
    fn control_handlers_fire_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new(ConnectionId(2), tx);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        conn.on_control(
            ControlEvent::Error,
            Box::new(move |detail| sink.lock().unwrap().push(detail.map(str::to_string))),
        );

        conn.fire(ControlEvent::Close, None);
        conn.fire(ControlEvent::Error, Some("reset"));
        conn.fire(ControlEvent::Error, Some("again"));

        assert_eq!(*seen.lock().unwrap(), vec![Some("reset".to_string())]);
    }

    #[test]
    fn writes_after_writer_exit_are_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let conn = WsConnection::new(ConnectionId(3), tx);
        conn.send("lost".to_string());
    }
}
