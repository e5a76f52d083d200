//! Distributed participant counts.
//!
//! Each instance counts its own connections per room and replicates those
//! counts to every peer over the bus. Replication is soft state: peers cache
//! what they last heard from each instance, a heartbeat keeps the cache alive,
//! and a cache that hears nothing for 2.5 heartbeats is evicted. The aggregate
//! for a room is always the local count plus every live peer's cached count.
//!
//! # Protocol
//!
//! ```text
//! start ──────────────► recipient caches sender, replies with a snapshot
//! ping  ──────────────► recipient resets sender's staleness timer
//! update {rooms} ─────► recipient applies new absolute counts as deltas
//! full-update {rooms} ► recipient zeroes sender's cache, then applies
//! stop  ──────────────► recipient evicts sender
//! ```
//!
//! A message of any other kind from an unknown sender is not trusted as a
//! delta. The recipient caches the sender empty and asks it for a snapshot on
//! `numPresent-request-full-update-<sender>`; the answer arrives on
//! `numPresent-full-update-response-<recipient>`.
//!
//! Snapshot requests are batched over a short window. When more than
//! `broadcast_threshold` distinct instances are waiting, one `full-update`
//! broadcast answers all of them.
//!
//! # Scheduling
//!
//! The coordinator is a Sans-IO state machine: it never sleeps and never
//! touches the bus. Local notifications and outbound `update`s are coalesced
//! per scheduling pass and fire on the next [`PresenceCoordinator::poll`];
//! heartbeats, evictions and snapshot replies fire once their deadline passes.

mod listeners;
mod message;
mod peer;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    time::Duration,
};

pub use listeners::{PresenceCallback, PresenceSubscription};
use listeners::PresenceListeners;
pub use message::{CHANNEL_PREFIX, PresenceKind, PresenceMessage};
use peer::PeerCache;

use crate::{
    batch::{Batched, Window},
    bus::BusAction,
    env::{Environment, Timestamp},
    ids::{ConnectionId, InstanceId},
};

/// Presence protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// How long snapshot requests are collected before answering
    pub reply_window: Duration,
    /// Above this many distinct requesters, one broadcast replaces unicasts
    pub broadcast_threshold: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            reply_window: Duration::from_millis(50),
            broadcast_threshold: 2,
        }
    }
}

impl PresenceConfig {
    /// Silence after which a peer is evicted: 2.5 heartbeats.
    pub fn staleness_window(&self) -> Duration {
        self.heartbeat_interval * 5 / 2
    }
}

/// State the batch handlers operate on.
#[derive(Debug)]
struct PresenceState<I> {
    id: InstanceId,
    /// Room → local connections present
    local: HashMap<String, BTreeSet<ConnectionId>>,
    /// Connection → rooms it is present in
    memberships: HashMap<ConnectionId, BTreeSet<String>>,
    /// Room → local count plus every live peer's cached count
    aggregate: HashMap<String, u64>,
    peers: HashMap<InstanceId, PeerCache<I>>,
    listeners: PresenceListeners,
    outbox: Vec<BusAction>,
    broadcast_threshold: usize,
    /// Between `connect` and `disconnect`; updates only go out while set
    connected: bool,
    /// Set once `stop` went out; silences notifications and publications
    stopped: bool,
}

impl<I> PresenceState<I> {
    fn local_count(&self, room: &str) -> u64 {
        self.local.get(room).map_or(0, |members| members.len() as u64)
    }

    fn count(&self, room: &str) -> u64 {
        self.aggregate.get(room).copied().unwrap_or(0)
    }

    fn local_snapshot(&self) -> BTreeMap<String, u64> {
        self.local.iter().map(|(room, members)| (room.clone(), members.len() as u64)).collect()
    }

    fn publish(
        &mut self,
        kind: PresenceKind,
        target: &InstanceId,
        rooms: Option<BTreeMap<String, u64>>,
    ) {
        let channel = kind.channel(target);
        match PresenceMessage::new(&self.id, rooms).encode() {
            Ok(payload) => self.outbox.push(BusAction::Publish { channel, payload }),
            Err(err) => tracing::warn!(%channel, %err, "presence message not published"),
        }
    }
}

/// Batch handler: tell local subscribers about changed aggregates.
fn notify_local<I>(state: &mut PresenceState<I>, rooms: Vec<String>) {
    if state.stopped {
        return;
    }
    let mut seen = HashSet::new();
    for room in rooms {
        if !seen.insert(room.clone()) {
            continue;
        }
        let count = state.count(&room);
        for callback in state.listeners.snapshot(&room) {
            callback(count);
        }
        if count == 0 {
            state.aggregate.remove(&room);
        }
    }
}

/// Batch handler: publish one `update` with the local counts of changed rooms.
fn publish_update<I>(state: &mut PresenceState<I>, rooms: Vec<String>) {
    if !state.connected {
        return;
    }
    let rooms: BTreeMap<String, u64> = rooms
        .into_iter()
        .map(|room| {
            let count = state.local_count(&room);
            (room, count)
        })
        .collect();
    let id = state.id.clone();
    state.publish(PresenceKind::Update, &id, Some(rooms));
}

/// Batch handler: answer pending snapshot requests.
fn publish_snapshots<I>(state: &mut PresenceState<I>, requesters: Vec<InstanceId>) {
    if state.stopped {
        return;
    }
    let mut seen = HashSet::new();
    let requesters: Vec<InstanceId> =
        requesters.into_iter().filter(|id| seen.insert(id.clone())).collect();
    let snapshot = state.local_snapshot();

    if requesters.len() > state.broadcast_threshold {
        tracing::debug!(requesters = requesters.len(), "broadcasting snapshot");
        let id = state.id.clone();
        state.publish(PresenceKind::FullUpdate, &id, Some(snapshot));
    } else {
        for requester in &requesters {
            state.publish(PresenceKind::FullUpdateResponse, requester, Some(snapshot.clone()));
        }
    }
}

/// Presence coordinator for one instance.
///
/// Generic over the environment's instant type so the same state machine runs
/// under the system clock and under virtual time.
#[derive(Debug)]
pub struct PresenceCoordinator<I> {
    config: PresenceConfig,
    state: PresenceState<I>,
    notify_local: Batched<PresenceState<I>, String, I>,
    notify_peers: Batched<PresenceState<I>, String, I>,
    replies: Batched<PresenceState<I>, InstanceId, I>,
    next_ping: Option<I>,
}

impl<I: Timestamp> PresenceCoordinator<I> {
    /// Create a coordinator with a fresh instance id.
    pub fn new<E: Environment<Instant = I>>(env: &E, config: PresenceConfig) -> Self {
        Self::with_id(InstanceId::generate(env), config)
    }

    /// Create a coordinator with a fixed instance id.
    pub fn with_id(id: InstanceId, config: PresenceConfig) -> Self {
        let state = PresenceState {
            id,
            local: HashMap::new(),
            memberships: HashMap::new(),
            aggregate: HashMap::new(),
            peers: HashMap::new(),
            listeners: PresenceListeners::default(),
            outbox: Vec::new(),
            broadcast_threshold: config.broadcast_threshold,
            connected: false,
            stopped: false,
        };
        Self {
            notify_local: Batched::new(Window::Yield, notify_local),
            notify_peers: Batched::new(Window::Yield, publish_update),
            replies: Batched::new(Window::Delay(config.reply_window), publish_snapshots),
            config,
            state,
            next_ping: None,
        }
    }

    /// Instance id announced on the bus.
    pub fn id(&self) -> &InstanceId {
        &self.state.id
    }

    /// Active configuration.
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Whether [`Self::connect`] ran and [`Self::disconnect`] has not.
    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    /// Join the bus: subscribe, announce `start`, arm the heartbeat.
    ///
    /// No-op once connected or after a disconnect.
    pub fn connect(&mut self, now: I) -> Vec<BusAction> {
        if self.state.connected || self.state.stopped {
            return Vec::new();
        }
        self.state.connected = true;

        let id = self.state.id.clone();
        for channel in PresenceKind::subscriptions(&id) {
            self.state.outbox.push(BusAction::Subscribe { channel });
        }
        self.state.publish(PresenceKind::Start, &id, None);
        // Counts gathered before connecting were never published
        if !self.state.local.is_empty() {
            let snapshot = self.state.local_snapshot();
            self.state.publish(PresenceKind::Update, &id, Some(snapshot));
        }
        self.next_ping = Some(now + self.config.heartbeat_interval);
        tracing::info!(instance = %id, "presence connected");
        self.drain()
    }

    /// Leave the bus: announce `stop` and go quiet.
    ///
    /// After this no notification, update or reply is emitted and inbound
    /// messages are ignored.
    pub fn disconnect(&mut self) -> Vec<BusAction> {
        if !self.state.connected {
            return Vec::new();
        }
        self.state.connected = false;
        self.next_ping = None;

        let id = self.state.id.clone();
        self.state.publish(PresenceKind::Stop, &id, None);
        for channel in PresenceKind::subscriptions(&id) {
            self.state.outbox.push(BusAction::Unsubscribe { channel });
        }
        self.state.stopped = true;
        tracing::info!(instance = %id, "presence disconnected");
        self.drain()
    }

    /// Count `connection` as present in `room`. Joining twice counts once.
    pub fn join(&mut self, connection: ConnectionId, room: &str, now: I) {
        let added = self.state.local.entry(room.to_string()).or_default().insert(connection);
        if !added {
            return;
        }
        self.state.memberships.entry(connection).or_default().insert(room.to_string());
        self.raise(room, 1, now);
        self.notify_peers.push(room.to_string(), now);
    }

    /// Stop counting `connection` in `room`. No-op if it was not present.
    pub fn leave(&mut self, connection: ConnectionId, room: &str, now: I) {
        let Some(members) = self.state.local.get_mut(room) else {
            return;
        };
        if !members.remove(&connection) {
            return;
        }
        if members.is_empty() {
            self.state.local.remove(room);
        }
        if let Some(rooms) = self.state.memberships.get_mut(&connection) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.state.memberships.remove(&connection);
            }
        }
        self.lower(room, 1, now);
        self.notify_peers.push(room.to_string(), now);
    }

    /// Stop counting `connection` anywhere.
    pub fn leave_all(&mut self, connection: ConnectionId, now: I) {
        let rooms = self.state.memberships.get(&connection).cloned().unwrap_or_default();
        for room in rooms {
            self.leave(connection, &room, now);
        }
    }

    /// Watch the aggregate count of `room`.
    ///
    /// With `emit_initial` the callback runs immediately with the current
    /// value. Later calls are batched per scheduling pass.
    pub fn subscribe(
        &mut self,
        room: &str,
        callback: PresenceCallback,
        emit_initial: bool,
    ) -> PresenceSubscription {
        if emit_initial {
            callback(self.state.count(room));
        }
        self.state.listeners.add(room, callback)
    }

    /// Drop a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, subscription: &PresenceSubscription) -> bool {
        self.state.listeners.remove(subscription)
    }

    /// Subscriptions currently registered for `room`.
    pub fn listener_count(&self, room: &str) -> usize {
        self.state.listeners.count(room)
    }

    /// Aggregate count across all live instances. 0 for unknown rooms.
    pub fn count(&self, room: &str) -> u64 {
        self.state.count(room)
    }

    /// Connections of this instance present in `room`.
    pub fn local_count(&self, room: &str) -> u64 {
        self.state.local_count(room)
    }

    /// Rooms `connection` is present in, sorted.
    pub fn rooms_for(&self, connection: ConnectionId) -> Vec<String> {
        self.state.memberships.get(&connection).into_iter().flatten().cloned().collect()
    }

    /// Number of peers with a live cache entry.
    pub fn peer_count(&self) -> usize {
        self.state.peers.len()
    }

    /// Ids of peers with a live cache entry, sorted.
    pub fn peer_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.state.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Last count `peer` reported for `room`. 0 if unknown.
    pub fn peer_room_count(&self, peer: &InstanceId, room: &str) -> u64 {
        self.state.peers.get(peer).map_or(0, |cache| cache.get(room))
    }

    /// Process a message received on a presence channel.
    ///
    /// Messages on foreign channels, without a sender, or from this instance
    /// are ignored, as is everything before connect or after disconnect.
    pub fn handle_bus_message(&mut self, channel: &str, payload: &str, now: I) -> Vec<BusAction> {
        if !self.state.connected {
            return Vec::new();
        }
        let Some(kind) = PresenceKind::classify(channel, &self.state.id) else {
            return Vec::new();
        };
        let message = match PresenceMessage::decode(channel, payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%err, "dropping presence message");
                return Vec::new();
            },
        };
        let Some(sender) = message.client_id.filter(|id| !id.as_str().is_empty()) else {
            return Vec::new();
        };
        if sender == self.state.id {
            return Vec::new();
        }

        let known = match self.state.peers.get_mut(&sender) {
            Some(peer) => {
                peer.touch(now);
                true
            },
            None => false,
        };
        let rooms = message.rooms.unwrap_or_default();

        match kind {
            PresenceKind::Start => {
                if !known {
                    tracing::info!(peer = %sender, "peer started");
                    self.state.peers.insert(sender.clone(), PeerCache::new(now));
                }
                self.replies.push(sender, now);
            },
            PresenceKind::Stop => {
                if known {
                    tracing::info!(peer = %sender, "peer stopped");
                    self.evict(&sender, now);
                }
            },
            PresenceKind::RequestFullUpdate => {
                if !known {
                    self.bootstrap(&sender, now);
                }
                self.replies.push(sender, now);
            },
            PresenceKind::FullUpdateResponse => {
                if !known {
                    self.state.peers.insert(sender.clone(), PeerCache::new(now));
                }
                self.clear_peer(&sender, now);
                self.apply(&sender, rooms, now);
            },
            _ if !known => self.bootstrap(&sender, now),
            PresenceKind::Ping => {},
            PresenceKind::Update => self.apply(&sender, rooms, now),
            PresenceKind::FullUpdate => {
                self.clear_peer(&sender, now);
                self.apply(&sender, rooms, now);
            },
        }
        self.drain()
    }

    /// Run everything that is due at `now`.
    ///
    /// Batches with the yield window fire first, then the heartbeat, peer
    /// eviction and snapshot replies. Notifications scheduled by those fire
    /// before returning.
    pub fn poll(&mut self, now: I) -> Vec<BusAction> {
        self.fire_yield(now);

        if let Some(due) = self.next_ping.filter(|due| *due <= now) {
            let id = self.state.id.clone();
            self.state.publish(PresenceKind::Ping, &id, None);
            let mut next = due + self.config.heartbeat_interval;
            while next <= now {
                next = next + self.config.heartbeat_interval;
            }
            self.next_ping = Some(next);
        }

        let window = self.config.staleness_window();
        let mut stale: Vec<InstanceId> = self
            .state
            .peers
            .iter()
            .filter(|(_, peer)| peer.expires_at(window) <= now)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        for peer in stale {
            tracing::info!(%peer, "peer evicted after silence");
            self.evict(&peer, now);
        }

        self.replies.fire_if_due(&mut self.state, now);
        self.fire_yield(now);
        self.drain()
    }

    /// Earliest instant at which [`Self::poll`] has work.
    pub fn next_deadline(&self) -> Option<I> {
        let window = self.config.staleness_window();
        [
            self.notify_local.deadline(),
            self.notify_peers.deadline(),
            self.replies.deadline(),
            self.next_ping,
            self.state.peers.values().map(|peer| peer.expires_at(window)).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every pending batch now, regardless of windows.
    pub fn flush(&mut self) -> Vec<BusAction> {
        self.notify_local.flush(&mut self.state);
        self.notify_peers.flush(&mut self.state);
        self.replies.flush(&mut self.state);
        self.drain()
    }

    fn fire_yield(&mut self, now: I) {
        self.notify_local.fire_if_due(&mut self.state, now);
        self.notify_peers.fire_if_due(&mut self.state, now);
    }

    fn drain(&mut self) -> Vec<BusAction> {
        std::mem::take(&mut self.state.outbox)
    }

    /// Cache an unknown sender empty and ask it for a snapshot.
    fn bootstrap(&mut self, sender: &InstanceId, now: I) {
        tracing::debug!(peer = %sender, "unknown peer, requesting snapshot");
        self.state.peers.insert(sender.clone(), PeerCache::new(now));
        self.state.publish(PresenceKind::RequestFullUpdate, sender, None);
    }

    /// Apply absolute counts from `sender` as deltas against its cache.
    fn apply(&mut self, sender: &InstanceId, rooms: BTreeMap<String, u64>, now: I) {
        for (room, count) in rooms {
            let Some(peer) = self.state.peers.get_mut(sender) else {
                return;
            };
            let previous = peer.set(&room, count);
            if count > previous {
                self.raise(&room, count - previous, now);
            } else if count < previous {
                self.lower(&room, previous - count, now);
            }
        }
    }

    /// Zero everything cached for `sender`, keeping the entry.
    fn clear_peer(&mut self, sender: &InstanceId, now: I) {
        let rooms = self.state.peers.get_mut(sender).map(PeerCache::take_all).unwrap_or_default();
        for (room, count) in rooms {
            self.lower(&room, count, now);
        }
    }

    /// Drop `peer` and subtract its contribution from every room.
    fn evict(&mut self, peer: &InstanceId, now: I) {
        let Some(mut cache) = self.state.peers.remove(peer) else {
            return;
        };
        for (room, count) in cache.take_all() {
            self.lower(&room, count, now);
        }
    }

    fn raise(&mut self, room: &str, by: u64, now: I) {
        let entry = self.state.aggregate.entry(room.to_string()).or_insert(0);
        *entry = entry.checked_add(by).unwrap_or_else(|| {
            tracing::warn!(room, "aggregate overflow, saturating");
            u64::MAX
        });
        self.notify_local.push(room.to_string(), now);
    }

    fn lower(&mut self, room: &str, by: u64, now: I) {
        let entry = self.state.aggregate.entry(room.to_string()).or_insert(0);
        *entry = entry.checked_sub(by).unwrap_or_else(|| {
            tracing::warn!(room, by, "aggregate underflow, clamping to zero");
            0
        });
        self.notify_local.push(room.to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Coordinator = PresenceCoordinator<Duration>;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn connected(id: &str) -> Coordinator {
        let mut c = Coordinator::with_id(InstanceId::from(id), PresenceConfig::default());
        c.connect(Duration::ZERO);
        c
    }

    fn recorder(c: &mut Coordinator, room: &str) -> Arc<Mutex<Vec<u64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.subscribe(room, Arc::new(move |n| sink.lock().unwrap().push(n)), false);
        seen
    }

    fn publishes(actions: &[BusAction]) -> Vec<(String, serde_json::Value)> {
        actions
            .iter()
            .filter_map(|a| match a {
                BusAction::Publish { channel, payload } => {
                    Some((channel.clone(), serde_json::from_str(payload).unwrap()))
                },
                _ => None,
            })
            .collect()
    }

    fn update(sender: &str, room: &str, count: u64) -> String {
        format!(r#"{{"clientId":"{sender}","rooms":{{"{room}":{count}}}}}"#)
    }

    #[test]
    fn connect_subscribes_and_announces() {
        let mut c = Coordinator::with_id(InstanceId::from("me"), PresenceConfig::default());
        let actions = c.connect(Duration::ZERO);

        let subscribed = actions.iter().filter(|a| matches!(a, BusAction::Subscribe { .. })).count();
        assert_eq!(subscribed, 7);
        assert_eq!(
            publishes(&actions),
            vec![("numPresent-start".to_string(), serde_json::json!({"clientId": "me"}))]
        );
        assert!(c.connect(Duration::ZERO).is_empty());
    }

    #[test]
    fn joins_before_connect_are_published_with_start() {
        let mut c = Coordinator::with_id(InstanceId::from("me"), PresenceConfig::default());
        c.join(ConnectionId(1), "x", Duration::ZERO);
        assert!(publishes(&c.poll(Duration::ZERO)).is_empty());

        let actions = c.connect(Duration::ZERO);
        assert_eq!(
            publishes(&actions),
            vec![
                ("numPresent-start".to_string(), serde_json::json!({"clientId": "me"})),
                (
                    "numPresent-update".to_string(),
                    serde_json::json!({"clientId": "me", "rooms": {"x": 1}})
                ),
            ]
        );
    }

    #[test]
    fn messages_without_a_sender_are_dropped() {
        let mut c = connected("me");
        for payload in [r#"{"rooms":{"x":3}}"#, r#"{"clientId":"","rooms":{"x":3}}"#] {
            let actions = c.handle_bus_message("numPresent-update", payload, secs(1));
            assert!(actions.is_empty());
        }
        assert_eq!(c.peer_count(), 0);
        assert_eq!(c.count("x"), 0);
    }

    #[test]
    fn joins_in_one_pass_coalesce() {
        let mut c = connected("me");
        let seen = recorder(&mut c, "x");

        c.join(ConnectionId(1), "x", secs(1));
        c.join(ConnectionId(2), "x", secs(1));
        c.join(ConnectionId(2), "x", secs(1));
        c.join(ConnectionId(3), "y", secs(1));

        let actions = c.poll(secs(1));
        assert_eq!(*seen.lock().unwrap(), vec![2]);
        assert_eq!(
            publishes(&actions),
            vec![(
                "numPresent-update".to_string(),
                serde_json::json!({"clientId": "me", "rooms": {"x": 2, "y": 1}})
            )]
        );
    }

    #[test]
    fn emit_initial_reports_current_value() {
        let mut c = connected("me");
        c.join(ConnectionId(1), "x", secs(0));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.subscribe("x", Arc::new(move |n| sink.lock().unwrap().push(n)), true);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn unknown_sender_triggers_bootstrap_not_delta() {
        let mut c = connected("me");
        let actions = c.handle_bus_message("numPresent-update", &update("b", "x", 3), secs(1));

        assert_eq!(c.count("x"), 0);
        assert_eq!(c.peer_count(), 1);
        assert_eq!(
            publishes(&actions),
            vec![(
                "numPresent-request-full-update-b".to_string(),
                serde_json::json!({"clientId": "me"})
            )]
        );

        c.handle_bus_message("numPresent-full-update-response-me", &update("b", "x", 3), secs(1));
        assert_eq!(c.count("x"), 3);
    }

    #[test]
    fn updates_apply_as_deltas() {
        let mut c = connected("me");
        c.join(ConnectionId(1), "x", secs(0));
        c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(0));

        c.handle_bus_message("numPresent-update", &update("b", "x", 2), secs(1));
        assert_eq!(c.count("x"), 3);
        c.handle_bus_message("numPresent-update", &update("b", "x", 1), secs(1));
        assert_eq!(c.count("x"), 2);
        assert_eq!(c.peer_room_count(&InstanceId::from("b"), "x"), 1);
        c.handle_bus_message("numPresent-update", &update("b", "x", 0), secs(1));
        assert_eq!(c.count("x"), 1);
    }

    #[test]
    fn full_update_replaces_cached_rooms() {
        let mut c = connected("me");
        c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(0));
        c.handle_bus_message("numPresent-update", &update("b", "x", 2), secs(0));

        c.handle_bus_message("numPresent-full-update", &update("b", "y", 4), secs(0));
        assert_eq!(c.count("x"), 0);
        assert_eq!(c.count("y"), 4);
    }

    #[test]
    fn start_is_answered_after_reply_window() {
        let mut c = connected("me");
        c.join(ConnectionId(1), "x", secs(0));
        c.poll(secs(0));

        c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(1));
        assert!(publishes(&c.poll(secs(1))).is_empty());

        let actions = c.poll(secs(1) + Duration::from_millis(50));
        assert_eq!(
            publishes(&actions),
            vec![(
                "numPresent-full-update-response-b".to_string(),
                serde_json::json!({"clientId": "me", "rooms": {"x": 1}})
            )]
        );
    }

    #[test]
    fn request_storm_becomes_one_broadcast() {
        let mut c = connected("me");
        for peer in ["b", "c", "d", "b"] {
            let payload = format!(r#"{{"clientId":"{peer}"}}"#);
            c.handle_bus_message("numPresent-request-full-update-me", &payload, secs(0));
        }

        let actions = c.flush();
        let full: Vec<_> =
            publishes(&actions).into_iter().filter(|(ch, _)| ch.contains("full-update")).collect();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].0, "numPresent-full-update");
    }

    #[test]
    fn two_requesters_get_unicasts() {
        let mut c = connected("me");
        c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(0));
        c.handle_bus_message("numPresent-start", r#"{"clientId":"c"}"#, secs(0));

        let channels: Vec<String> =
            publishes(&c.flush()).into_iter().map(|(channel, _)| channel).collect();
        assert_eq!(
            channels,
            vec!["numPresent-full-update-response-b", "numPresent-full-update-response-c"]
        );
    }

    #[test]
    fn silent_peer_is_evicted_once() {
        let mut c = connected("me");
        let seen = recorder(&mut c, "x");
        c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(0));
        c.handle_bus_message("numPresent-update", &update("b", "x", 2), secs(0));
        c.poll(secs(0));

        c.poll(Duration::from_millis(37_499));
        assert_eq!(c.peer_count(), 1);

        c.poll(Duration::from_millis(37_500));
        assert_eq!(c.peer_count(), 0);
        assert_eq!(c.count("x"), 0);
        assert_eq!(*seen.lock().unwrap(), vec![2, 0]);

        c.poll(secs(100));
        assert_eq!(*seen.lock().unwrap(), vec![2, 0]);
    }

    #[test]
    fn ping_keeps_peer_alive() {
        let mut c = connected("me");
        c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(0));
        c.handle_bus_message("numPresent-ping", r#"{"clientId":"b"}"#, secs(30));
        c.poll(secs(40));
        assert_eq!(c.peer_count(), 1);
        assert_eq!(c.next_deadline(), Some(secs(45)));
    }

    #[test]
    fn heartbeat_fires_every_interval() {
        let mut c = connected("me");
        assert_eq!(c.next_deadline(), Some(secs(15)));

        let pings = |actions: Vec<BusAction>| {
            publishes(&actions).into_iter().filter(|(ch, _)| ch == "numPresent-ping").count()
        };
        assert_eq!(pings(c.poll(secs(14))), 0);
        assert_eq!(pings(c.poll(secs(15))), 1);
        assert_eq!(pings(c.poll(secs(16))), 0);
        assert_eq!(c.next_deadline(), Some(secs(30)));
    }

    #[test]
    fn stop_evicts_immediately() {
        let mut c = connected("me");
        c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(0));
        c.handle_bus_message("numPresent-update", &update("b", "x", 5), secs(0));

        c.handle_bus_message("numPresent-stop", r#"{"clientId":"b"}"#, secs(1));
        assert_eq!(c.count("x"), 0);
        assert_eq!(c.peer_count(), 0);
    }

    #[test]
    fn own_and_anonymous_messages_are_ignored() {
        let mut c = connected("me");
        assert!(c.handle_bus_message("numPresent-update", &update("me", "x", 1), secs(0)).is_empty());
        assert!(c.handle_bus_message("numPresent-update", r#"{"rooms":{"x":1}}"#, secs(0)).is_empty());
        assert!(c.handle_bus_message("numPresent-update", "garbage", secs(0)).is_empty());
        assert_eq!(c.peer_count(), 0);
    }

    #[test]
    fn disconnect_silences_everything() {
        let mut c = connected("me");
        let seen = recorder(&mut c, "x");
        c.join(ConnectionId(1), "x", secs(0));

        let actions = c.disconnect();
        assert_eq!(publishes(&actions)[0].0, "numPresent-stop");

        assert!(c.poll(secs(0)).is_empty());
        assert!(seen.lock().unwrap().is_empty());
        assert!(c.handle_bus_message("numPresent-start", r#"{"clientId":"b"}"#, secs(0)).is_empty());
        assert!(c.connect(secs(1)).is_empty());
    }

    #[test]
    fn leave_all_releases_every_room() {
        let mut c = connected("me");
        let conn = ConnectionId(9);
        c.join(conn, "a", secs(0));
        c.join(conn, "b", secs(0));
        c.leave_all(conn, secs(0));

        assert_eq!(c.local_count("a"), 0);
        assert_eq!(c.local_count("b"), 0);
        assert!(c.rooms_for(conn).is_empty());
        let actions = c.poll(secs(0));
        assert_eq!(
            publishes(&actions)[0].1,
            serde_json::json!({"clientId": "me", "rooms": {"a": 0, "b": 0}})
        );
    }

    #[test]
    fn unsubscribe_stops_callbacks() {
        let mut c = connected("me");
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let sub = c.subscribe("x", Arc::new(move |_| *sink.lock().unwrap() += 1), false);

        assert!(c.unsubscribe(&sub));
        assert!(!c.unsubscribe(&sub));
        c.join(ConnectionId(1), "x", secs(0));
        c.poll(secs(0));
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
