//! Last-known counts of one remote instance.

use std::collections::HashMap;

use crate::env::Timestamp;

/// Cached per-room counts reported by one peer, plus when it was last heard.
#[derive(Debug, Clone)]
pub(crate) struct PeerCache<I> {
    rooms: HashMap<String, u64>,
    last_seen: I,
}

impl<I: Timestamp> PeerCache<I> {
    pub(crate) fn new(now: I) -> Self {
        Self { rooms: HashMap::new(), last_seen: now }
    }

    /// Reset the staleness timer.
    pub(crate) fn touch(&mut self, now: I) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// When the entry goes stale.
    pub(crate) fn expires_at(&self, window: std::time::Duration) -> I {
        self.last_seen + window
    }

    pub(crate) fn get(&self, room: &str) -> u64 {
        self.rooms.get(room).copied().unwrap_or(0)
    }

    /// Store a new absolute count, returning the previous one. Zero counts
    /// are not stored.
    pub(crate) fn set(&mut self, room: &str, count: u64) -> u64 {
        let previous = if count == 0 {
            self.rooms.remove(room)
        } else {
            self.rooms.insert(room.to_string(), count)
        };
        previous.unwrap_or(0)
    }

    /// Empty the cache, returning what it held in room order.
    pub(crate) fn take_all(&mut self) -> Vec<(String, u64)> {
        let mut rooms: Vec<(String, u64)> = self.rooms.drain().collect();
        rooms.sort();
        rooms
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn zero_count_deletes_entry() {
        let mut peer = PeerCache::new(Duration::ZERO);
        assert_eq!(peer.set("x", 3), 0);
        assert_eq!(peer.set("x", 0), 3);
        assert_eq!(peer.get("x"), 0);
        assert!(peer.take_all().is_empty());
    }

    #[test]
    fn touch_moves_expiry_forward_only() {
        let mut peer = PeerCache::new(Duration::from_secs(10));
        peer.touch(Duration::from_secs(5));
        assert_eq!(peer.expires_at(Duration::from_secs(1)), Duration::from_secs(11));
        peer.touch(Duration::from_secs(20));
        assert_eq!(peer.expires_at(Duration::from_secs(1)), Duration::from_secs(21));
    }
}
