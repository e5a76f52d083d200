//! Room registry with cross-process fan-out.
//!
//! The registry maintains bidirectional mappings: room → connections (for
//! broadcast) and connection → rooms (for cleanup on close). Rooms are created
//! lazily on first join and deleted on last leave; with a bus attached, each
//! live room is mirrored by a subscription to `<prefix><room>`.
//!
//! A broadcast is delivered to local members directly and published on the
//! room channel. Peer registries relay it to their own members. Each registry
//! ignores bus messages carrying its own id, since it already delivered them.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    bus::BusAction,
    env::Environment,
    error::ProtocolError,
    ids::{ConnectionId, InstanceId},
};

/// Default prefix of room broadcast channels.
pub const DEFAULT_CHANNEL_PREFIX: &str = "socket-rooms-";

/// Room registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Prefix prepended to a room name to form its bus channel
    pub channel_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string() }
    }
}

/// Effects produced by registry operations.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryAction {
    /// Execute a bus operation
    Bus(BusAction),
    /// Send an event to a local connection
    Deliver {
        /// Recipient
        connection: ConnectionId,
        /// Event name
        event_name: String,
        /// Event payload
        data: Value,
    },
}

/// Payload published on a room channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomBroadcast {
    /// Registry that originated the broadcast
    #[serde(rename = "clientId")]
    pub origin: InstanceId,
    /// Event name
    pub event_name: String,
    /// Event payload
    #[serde(default)]
    pub data: Value,
}

/// Local room membership, mirrored onto the bus.
#[derive(Debug)]
pub struct RoomRegistry {
    id: InstanceId,
    config: RegistryConfig,
    /// Room → members. Ordered so delivery order is deterministic
    rooms: HashMap<String, BTreeSet<ConnectionId>>,
    /// Connection → rooms it has joined
    memberships: HashMap<ConnectionId, HashSet<String>>,
    bus_attached: bool,
}

impl RoomRegistry {
    /// Create a registry with a fresh instance id.
    pub fn new<E: Environment>(env: &E, config: RegistryConfig) -> Self {
        Self::with_id(InstanceId::generate(env), config)
    }

    /// Create a registry with a fixed instance id.
    pub fn with_id(id: InstanceId, config: RegistryConfig) -> Self {
        Self {
            id,
            config,
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            bus_attached: false,
        }
    }

    /// Instance id carried in published broadcasts.
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Active configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Bus channel mirroring `room`.
    pub fn channel_for(&self, room: &str) -> String {
        format!("{}{room}", self.config.channel_prefix)
    }

    /// Whether bus mirroring is enabled.
    pub fn has_bus(&self) -> bool {
        self.bus_attached
    }

    /// Enable bus mirroring.
    ///
    /// Subscribes to the channel of every room that already has members.
    /// Calling it again is a no-op.
    pub fn attach_bus(&mut self) -> Vec<RegistryAction> {
        if self.bus_attached {
            return Vec::new();
        }
        self.bus_attached = true;

        let mut rooms: Vec<&String> = self.rooms.keys().collect();
        rooms.sort();
        rooms
            .into_iter()
            .map(|room| RegistryAction::Bus(BusAction::Subscribe { channel: self.channel_for(room) }))
            .collect()
    }

    /// Add `connection` to `room`. Re-joining is a no-op.
    pub fn join(&mut self, connection: ConnectionId, room: &str) -> Vec<RegistryAction> {
        let mut actions = Vec::new();

        if !self.rooms.contains_key(room) {
            tracing::debug!(room, "room created");
            if self.bus_attached {
                actions.push(RegistryAction::Bus(BusAction::Subscribe {
                    channel: self.channel_for(room),
                }));
            }
            self.rooms.insert(room.to_string(), BTreeSet::new());
        }

        let added = self.rooms.get_mut(room).is_some_and(|members| members.insert(connection));
        if added {
            self.memberships.entry(connection).or_default().insert(room.to_string());
        }
        actions
    }

    /// Remove `connection` from `room`. No-op if it was not a member.
    ///
    /// Deleting the last member deletes the room and drops its bus
    /// subscription.
    pub fn leave(&mut self, connection: ConnectionId, room: &str) -> Vec<RegistryAction> {
        let Some(members) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        if !members.remove(&connection) {
            return Vec::new();
        }

        if let Some(rooms) = self.memberships.get_mut(&connection) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.memberships.remove(&connection);
            }
        }

        if !members.is_empty() {
            return Vec::new();
        }

        self.rooms.remove(room);
        tracing::debug!(room, "room deleted");
        if self.bus_attached {
            vec![RegistryAction::Bus(BusAction::Unsubscribe { channel: self.channel_for(room) })]
        } else {
            Vec::new()
        }
    }

    /// Remove `connection` from every room it is in.
    pub fn leave_all(&mut self, connection: ConnectionId) -> Vec<RegistryAction> {
        let mut rooms: Vec<String> =
            self.memberships.get(&connection).into_iter().flatten().cloned().collect();
        rooms.sort();

        rooms.iter().flat_map(|room| self.leave(connection, room)).collect()
    }

    /// Deliver an event to every member of `room`, here and on peers.
    pub fn broadcast(&self, room: &str, event_name: &str, data: Value) -> Vec<RegistryAction> {
        let mut actions = self.deliver_local(room, event_name, &data);

        if self.bus_attached {
            let message = RoomBroadcast {
                origin: self.id.clone(),
                event_name: event_name.to_string(),
                data,
            };
            match serde_json::to_string(&message) {
                Ok(payload) => actions.push(RegistryAction::Bus(BusAction::Publish {
                    channel: self.channel_for(room),
                    payload,
                })),
                Err(err) => tracing::warn!(room, %err, "broadcast not published"),
            }
        }
        actions
    }

    /// Relay a message that arrived on the bus.
    ///
    /// Messages on foreign channels, from this registry itself, or that fail
    /// to decode produce nothing.
    pub fn handle_bus_message(&self, channel: &str, payload: &str) -> Vec<RegistryAction> {
        let Some(room) = channel.strip_prefix(self.config.channel_prefix.as_str()) else {
            return Vec::new();
        };

        let message = match decode_broadcast(channel, payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%err, "dropping room broadcast");
                return Vec::new();
            },
        };

        if message.origin == self.id {
            return Vec::new();
        }
        self.deliver_local(room, &message.event_name, &message.data)
    }

    fn deliver_local(&self, room: &str, event_name: &str, data: &Value) -> Vec<RegistryAction> {
        self.members(room)
            .map(|connection| RegistryAction::Deliver {
                connection,
                event_name: event_name.to_string(),
                data: data.clone(),
            })
            .collect()
    }

    /// Whether `connection` is a member of `room`.
    pub fn is_member(&self, connection: ConnectionId, room: &str) -> bool {
        self.rooms.get(room).is_some_and(|members| members.contains(&connection))
    }

    /// Members of `room` in ascending id order.
    pub fn members(&self, room: &str) -> impl Iterator<Item = ConnectionId> + '_ {
        self.rooms.get(room).into_iter().flat_map(|members| members.iter().copied())
    }

    /// Rooms `connection` has joined, sorted.
    pub fn rooms_for(&self, connection: ConnectionId) -> Vec<String> {
        let mut rooms: Vec<String> =
            self.memberships.get(&connection).into_iter().flatten().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Number of rooms with at least one local member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn decode_broadcast(channel: &str, payload: &str) -> Result<RoomBroadcast, ProtocolError> {
    serde_json::from_str(payload).map_err(|e| ProtocolError::MalformedBusPayload {
        channel: channel.to_string(),
        reason: e.to_string(),
    })
}
