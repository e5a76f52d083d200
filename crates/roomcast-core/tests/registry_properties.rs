//! Property-based tests for RoomRegistry
//!
//! Membership must always reflect the last join/leave for each
//! (connection, room) pair, and bus subscriptions must track exactly the set
//! of non-empty rooms.

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use roomcast_core::{
    BusAction, ConnectionId, InstanceId, RegistryAction, RegistryConfig, RoomRegistry,
};

#[derive(Debug, Clone)]
enum Op {
    Join(u64, u8),
    Leave(u64, u8),
    LeaveAll(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..6, 0u8..4).prop_map(|(c, r)| Op::Join(c, r)),
        3 => (0u64..6, 0u8..4).prop_map(|(c, r)| Op::Leave(c, r)),
        1 => (0u64..6).prop_map(Op::LeaveAll),
    ]
}

fn room(r: u8) -> String {
    format!("room-{r}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: membership(c, r) is true iff the last operation touching
    /// (c, r) was a join
    #[test]
    fn prop_membership_follows_last_call(ops in prop::collection::vec(op(), 0..60)) {
        let mut registry = RoomRegistry::with_id(InstanceId::from("a"), RegistryConfig::default());
        let mut model: HashMap<(u64, u8), bool> = HashMap::new();

        for op in &ops {
            match *op {
                Op::Join(c, r) => {
                    registry.join(ConnectionId(c), &room(r));
                    model.insert((c, r), true);
                },
                Op::Leave(c, r) => {
                    registry.leave(ConnectionId(c), &room(r));
                    model.insert((c, r), false);
                },
                Op::LeaveAll(c) => {
                    registry.leave_all(ConnectionId(c));
                    for r in 0..4 {
                        model.insert((c, r), false);
                    }
                },
            }
        }

        for c in 0..6 {
            for r in 0..4 {
                let expected = model.get(&(c, r)).copied().unwrap_or(false);
                prop_assert_eq!(registry.is_member(ConnectionId(c), &room(r)), expected);
            }
        }
    }

    /// Property: the bus is subscribed to exactly the rooms with members
    #[test]
    fn prop_subscriptions_track_live_rooms(ops in prop::collection::vec(op(), 0..60)) {
        let mut registry = RoomRegistry::with_id(InstanceId::from("a"), RegistryConfig::default());
        prop_assert!(registry.attach_bus().is_empty());
        let mut subscribed: BTreeSet<String> = BTreeSet::new();

        for op in &ops {
            let actions = match *op {
                Op::Join(c, r) => registry.join(ConnectionId(c), &room(r)),
                Op::Leave(c, r) => registry.leave(ConnectionId(c), &room(r)),
                Op::LeaveAll(c) => registry.leave_all(ConnectionId(c)),
            };
            for action in actions {
                match action {
                    RegistryAction::Bus(BusAction::Subscribe { channel }) => {
                        prop_assert!(subscribed.insert(channel), "double subscribe");
                    },
                    RegistryAction::Bus(BusAction::Unsubscribe { channel }) => {
                        prop_assert!(subscribed.remove(&channel), "unsubscribe without subscribe");
                    },
                    other => prop_assert!(false, "unexpected action {:?}", other),
                }
            }
        }

        let live: BTreeSet<String> = (0..4)
            .filter(|r| registry.members(&room(*r)).next().is_some())
            .map(|r| registry.channel_for(&room(r)))
            .collect();
        prop_assert_eq!(subscribed, live);
        prop_assert_eq!(registry.room_count(), registry_live_rooms(&registry));
    }

    /// Property: a broadcast reaches each member exactly once, locally or via
    /// a peer, never both
    #[test]
    fn prop_broadcast_reaches_each_member_once(
        local in prop::collection::btree_set(0u64..10, 0..5),
        remote in prop::collection::btree_set(10u64..20, 0..5),
    ) {
        let mut a = RoomRegistry::with_id(InstanceId::from("a"), RegistryConfig::default());
        let mut b = RoomRegistry::with_id(InstanceId::from("b"), RegistryConfig::default());
        a.attach_bus();
        b.attach_bus();
        for c in &local {
            a.join(ConnectionId(*c), "x");
        }
        for c in &remote {
            b.join(ConnectionId(*c), "x");
        }

        let mut delivered = Vec::new();
        let mut published = Vec::new();
        for action in a.broadcast("x", "e", serde_json::json!(null)) {
            match action {
                RegistryAction::Deliver { connection, .. } => delivered.push(connection.0),
                RegistryAction::Bus(BusAction::Publish { channel, payload }) => {
                    published.push((channel, payload));
                },
                RegistryAction::Bus(_) => {},
            }
        }
        for (channel, payload) in &published {
            for registry in [&a, &b] {
                for action in registry.handle_bus_message(channel, payload) {
                    if let RegistryAction::Deliver { connection, .. } = action {
                        delivered.push(connection.0);
                    }
                }
            }
        }

        delivered.sort_unstable();
        let expected: Vec<u64> = local.iter().chain(remote.iter()).copied().collect();
        prop_assert_eq!(delivered, expected);
    }
}

fn registry_live_rooms(registry: &RoomRegistry) -> usize {
    (0..4).filter(|r| registry.members(&room(*r)).next().is_some()).count()
}
