//! Fuzz target for the room registry
//!
//! Random joins, leaves and inbound bus traffic against a registry with a
//! plain-set model beside it.
//!
//! # Invariants
//!
//! - Membership always matches the model
//! - A room channel is subscribed exactly while the room has local members
//! - Bus messages only ever produce deliveries to current members

#![no_main]

use std::collections::{BTreeSet, HashSet};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomcast_core::{
    BusAction, ConnectionId, InstanceId, RegistryAction, RegistryConfig, RoomRegistry,
};

const ROOMS: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Arbitrary)]
enum Step {
    Join { connection: u8, room: u8 },
    Leave { connection: u8, room: u8 },
    LeaveAll { connection: u8 },
    Broadcast { room: u8, event_name: String },
    Inbound { room: u8, payload: String },
}

fn room(selector: u8) -> &'static str {
    ROOMS[selector as usize % ROOMS.len()]
}

fuzz_target!(|steps: Vec<Step>| {
    let mut registry = RoomRegistry::with_id(InstanceId::from("me"), RegistryConfig::default());
    registry.attach_bus();

    let mut model: BTreeSet<(u64, &str)> = BTreeSet::new();
    let mut subscribed: HashSet<String> = HashSet::new();

    for step in steps {
        let actions = match step {
            Step::Join { connection, room: r } => {
                let connection = u64::from(connection % 4);
                model.insert((connection, room(r)));
                registry.join(ConnectionId(connection), room(r))
            },
            Step::Leave { connection, room: r } => {
                let connection = u64::from(connection % 4);
                model.remove(&(connection, room(r)));
                registry.leave(ConnectionId(connection), room(r))
            },
            Step::LeaveAll { connection } => {
                let connection = u64::from(connection % 4);
                model.retain(|(member, _)| *member != connection);
                registry.leave_all(ConnectionId(connection))
            },
            Step::Broadcast { room: r, event_name } => {
                registry.broadcast(room(r), &event_name, serde_json::Value::Null)
            },
            Step::Inbound { room: r, payload } => {
                registry.handle_bus_message(&registry.channel_for(room(r)), &payload)
            },
        };

        for action in actions {
            match action {
                RegistryAction::Bus(BusAction::Subscribe { channel }) => {
                    subscribed.insert(channel);
                },
                RegistryAction::Bus(BusAction::Unsubscribe { channel }) => {
                    subscribed.remove(&channel);
                },
                RegistryAction::Bus(_) => {},
                RegistryAction::Deliver { connection, .. } => {
                    assert!(model.iter().any(|(member, _)| *member == connection.0));
                },
            }
        }

        for r in ROOMS {
            let has_members = model.iter().any(|(_, joined)| *joined == r);
            assert_eq!(subscribed.contains(&registry.channel_for(r)), has_members);
            for connection in 0..4 {
                assert_eq!(
                    registry.is_member(ConnectionId(connection), r),
                    model.contains(&(connection, r))
                );
            }
        }
    }
});
