//! Typed callback registry for aggregate count changes.

use std::{collections::HashMap, fmt, sync::Arc};

/// Callback receiving a room's new aggregate count.
pub type PresenceCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Handle returned by a subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceSubscription {
    room: String,
    id: u64,
}

impl PresenceSubscription {
    /// Room the subscription watches.
    pub fn room(&self) -> &str {
        &self.room
    }
}

/// Listeners per room, in registration order.
#[derive(Default)]
pub(crate) struct PresenceListeners {
    next_id: u64,
    rooms: HashMap<String, Vec<(u64, PresenceCallback)>>,
}

impl PresenceListeners {
    pub(crate) fn add(&mut self, room: &str, callback: PresenceCallback) -> PresenceSubscription {
        let id = self.next_id;
        self.next_id += 1;
        self.rooms.entry(room.to_string()).or_default().push((id, callback));
        PresenceSubscription { room: room.to_string(), id }
    }

    pub(crate) fn remove(&mut self, subscription: &PresenceSubscription) -> bool {
        let Some(listeners) = self.rooms.get_mut(&subscription.room) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription.id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.rooms.remove(&subscription.room);
        }
        removed
    }

    /// Copy of a room's callbacks, safe to invoke while the registry changes.
    pub(crate) fn snapshot(&self, room: &str) -> Vec<PresenceCallback> {
        self.rooms
            .get(room)
            .map(|listeners| listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, Vec::len)
    }
}

impl fmt::Debug for PresenceListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> =
            self.rooms.iter().map(|(room, l)| (room.as_str(), l.len())).collect();
        f.debug_struct("PresenceListeners").field("rooms", &counts).finish_non_exhaustive()
    }
}
