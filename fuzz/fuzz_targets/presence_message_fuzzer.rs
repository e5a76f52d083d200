//! Fuzz target for the presence coordinator
//!
//! # Strategy
//!
//! - Well-formed messages from a handful of peers on every presence channel
//! - Raw channel/payload pairs, including garbage JSON and foreign channels
//! - Local joins and leaves interleaved with both
//! - Clock jumps that trigger heartbeats and eviction
//!
//! # Invariants
//!
//! - Aggregate count == local count + counts cached for live peers
//! - After the staleness window with no traffic, only local counts remain
//! - Nothing panics
//!
//! Raw payloads carrying counts above `u32::MAX` are skipped: the aggregate
//! saturates there and the sum no longer holds.

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomcast_core::{ConnectionId, InstanceId, PresenceConfig, PresenceCoordinator, PresenceKind};

const PEERS: [&str; 3] = ["p0", "p1", "p2"];
const ROOMS: [&str; 3] = ["r0", "r1", "r2"];

#[derive(Debug, Arbitrary)]
enum Step {
    Join { connection: u8, room: u8 },
    Leave { connection: u8, room: u8 },
    Message { peer: u8, kind: u8, rooms: Vec<(u8, u16)> },
    Raw { channel: String, payload: String },
    Advance { millis: u16 },
}

fn kind(selector: u8) -> PresenceKind {
    match selector % 7 {
        0 => PresenceKind::Start,
        1 => PresenceKind::Stop,
        2 => PresenceKind::Ping,
        3 => PresenceKind::Update,
        4 => PresenceKind::FullUpdate,
        5 => PresenceKind::RequestFullUpdate,
        _ => PresenceKind::FullUpdateResponse,
    }
}

fn room(selector: u8) -> &'static str {
    ROOMS[selector as usize % ROOMS.len()]
}

fn oversized(payload: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        return false;
    };
    value.get("rooms").and_then(serde_json::Value::as_object).is_some_and(|rooms| {
        rooms.values().any(|n| n.as_u64().is_some_and(|n| n > u64::from(u32::MAX)))
    })
}

fn check(c: &PresenceCoordinator<Duration>) {
    for room in ROOMS {
        let peers: u64 = c.peer_ids().iter().map(|peer| c.peer_room_count(peer, room)).sum();
        assert_eq!(c.count(room), c.local_count(room) + peers, "room {room}");
    }
}

fuzz_target!(|steps: Vec<Step>| {
    let me = InstanceId::from("me");
    let config = PresenceConfig::default();
    let mut c = PresenceCoordinator::with_id(me.clone(), config.clone());
    let mut now = Duration::ZERO;
    c.connect(now);

    for step in steps {
        match step {
            Step::Join { connection, room: r } => {
                c.join(ConnectionId(u64::from(connection % 8)), room(r), now);
            },
            Step::Leave { connection, room: r } => {
                c.leave(ConnectionId(u64::from(connection % 8)), room(r), now);
            },
            Step::Message { peer, kind: k, rooms } => {
                let sender = PEERS[peer as usize % PEERS.len()];
                let rooms: serde_json::Map<String, serde_json::Value> = rooms
                    .iter()
                    .map(|(r, n)| (room(*r).to_string(), u64::from(*n).into()))
                    .collect();
                let payload = serde_json::json!({"clientId": sender, "rooms": rooms});
                c.handle_bus_message(&kind(k).channel(&me), &payload.to_string(), now);
            },
            Step::Raw { channel, payload } => {
                if oversized(&payload) {
                    continue;
                }
                c.handle_bus_message(&channel, &payload, now);
            },
            Step::Advance { millis } => {
                now += Duration::from_millis(u64::from(millis));
                c.poll(now);
            },
        }
        check(&c);
    }

    c.poll(now + config.staleness_window());
    assert_eq!(c.peer_count(), 0);
    for room in ROOMS {
        assert_eq!(c.count(room), c.local_count(room));
    }
});
