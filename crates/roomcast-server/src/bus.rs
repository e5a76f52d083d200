//! In-process bus.
//!
//! [`LocalBusHub`] stands in for an external publish/subscribe service when
//! several hubs share one process. Each connected [`LocalBus`] owns an inbox;
//! a publish is copied into the inbox of every bus subscribed to the channel,
//! the publisher included, in subscription order. Delivery per subscriber is
//! in publish order.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use roomcast_core::Bus;
use tokio::sync::mpsc;

/// Receiving half of a bus: `(channel, payload)` pairs.
pub type BusInbox = mpsc::UnboundedReceiver<(String, String)>;

type Subscriber = (u64, mpsc::UnboundedSender<(String, String)>);

#[derive(Default)]
struct Channels {
    next_id: u64,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// Shared broker for [`LocalBus`] endpoints.
#[derive(Clone, Default)]
pub struct LocalBusHub {
    channels: Arc<Mutex<Channels>>,
}

impl LocalBusHub {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new endpoint and the inbox it receives on.
    pub fn connect(&self) -> (LocalBus, BusInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut channels = self.lock();
            channels.next_id += 1;
            channels.next_id
        };
        (LocalBus { hub: self.clone(), id, inbox: tx }, rx)
    }

    /// Number of endpoints subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().subscribers.get(channel).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LocalBusHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBusHub")
            .field("channels", &self.lock().subscribers.len())
            .finish()
    }
}

/// One endpoint on a [`LocalBusHub`].
#[derive(Clone)]
pub struct LocalBus {
    hub: LocalBusHub,
    id: u64,
    inbox: mpsc::UnboundedSender<(String, String)>,
}

impl Bus for LocalBus {
    fn publish(&self, channel: &str, payload: &str) {
        let mut channels = self.hub.lock();
        let Some(subscribers) = channels.subscribers.get_mut(channel) else {
            tracing::trace!(channel, "publish with no subscribers");
            return;
        };
        subscribers.retain(|(_, tx)| tx.send((channel.to_string(), payload.to_string())).is_ok());
    }

    fn subscribe(&self, channel: &str) {
        let mut channels = self.hub.lock();
        let subscribers = channels.subscribers.entry(channel.to_string()).or_default();
        if subscribers.iter().all(|(id, _)| *id != self.id) {
            subscribers.push((self.id, self.inbox.clone()));
        }
    }

    fn unsubscribe(&self, channel: &str) {
        let mut channels = self.hub.lock();
        if let Some(subscribers) = channels.subscribers.get_mut(channel) {
            subscribers.retain(|(id, _)| *id != self.id);
            if subscribers.is_empty() {
                channels.subscribers.remove(channel);
            }
        }
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus").field("id", &self.id).finish_non_exhaustive()
    }
}
