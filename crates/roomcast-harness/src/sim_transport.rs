//! Recording transport for simulated connections.
//!
//! Frames written by the hub are kept for inspection; control handlers are
//! kept until the simulation fires them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use roomcast_core::{ConnectionId, ControlEvent, ControlHandler, Transport};
use serde_json::Value;

#[derive(Default)]
struct Inner {
    sent: Vec<String>,
    close_requested: bool,
    controls: Vec<(ControlEvent, ControlHandler)>,
}

/// Simulated connection handle.
#[derive(Clone)]
pub struct SimTransport {
    id: ConnectionId,
    inner: Arc<Mutex<Inner>>,
}

impl SimTransport {
    /// Create a transport for `id`.
    pub fn new(id: ConnectionId) -> Self {
        Self { id, inner: Arc::new(Mutex::new(Inner::default())) }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Every frame written so far, parsed. Unparseable frames are skipped.
    pub fn events(&self) -> Vec<Value> {
        self.lock().sent.iter().filter_map(|frame| serde_json::from_str(frame).ok()).collect()
    }

    /// `data` of every event named `event_name`, in arrival order.
    pub fn received(&self, event_name: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|event| event["eventName"] == event_name)
            .map(|mut event| event["data"].take())
            .collect()
    }

    /// Last `data` received for `event_name`.
    pub fn last(&self, event_name: &str) -> Option<Value> {
        self.received(event_name).pop()
    }

    /// Forget recorded frames.
    pub fn clear(&self) {
        self.lock().sent.clear();
    }

    /// Whether the hub asked to close this connection.
    pub fn close_requested(&self) -> bool {
        self.lock().close_requested
    }

    /// Run and discard the handlers registered for `event`.
    pub fn fire(&self, event: ControlEvent, detail: Option<&str>) {
        let handlers: Vec<ControlHandler> = {
            let mut inner = self.lock();
            let (fired, kept): (Vec<_>, Vec<_>) =
                inner.controls.drain(..).partition(|(registered, _)| *registered == event);
            inner.controls = kept;
            fired.into_iter().map(|(_, handler)| handler).collect()
        };
        for mut handler in handlers {
            handler(detail);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SimTransport {
    fn send(&self, frame: String) {
        self.lock().sent.push(frame);
    }

    fn close(&self) {
        self.lock().close_requested = true;
    }

    fn on_control(&self, event: ControlEvent, handler: ControlHandler) {
        self.lock().controls.push((event, handler));
    }
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport").field("id", &self.id).finish_non_exhaustive()
    }
}
