//! Property-based cluster tests.
//!
//! Random membership churn on a simulated cluster. Without loss every node
//! must agree on the true total; with loss, a survivor must fall back to its
//! own local counts once every peer is gone.

use std::{collections::BTreeSet, time::Duration};

use proptest::prelude::*;
use roomcast_core::ConnectionId;
use roomcast_harness::SimCluster;

const NODES: usize = 3;
const CONNECTIONS_PER_NODE: usize = 2;
const ROOMS: [&str; 2] = ["x", "y"];

#[derive(Debug, Clone)]
enum Op {
    Join { node: usize, slot: usize, room: usize },
    Leave { node: usize, slot: usize, room: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let target = (0..NODES, 0..CONNECTIONS_PER_NODE, 0..ROOMS.len());
    prop_oneof![
        target.clone().prop_map(|(node, slot, room)| Op::Join { node, slot, room }),
        target.prop_map(|(node, slot, room)| Op::Leave { node, slot, room }),
    ]
}

/// Started cluster with every connection already open.
fn cluster_with_connections(seed: u64) -> (SimCluster, Vec<Vec<ConnectionId>>) {
    let mut cluster = SimCluster::new(seed, NODES);
    cluster.start_all();
    cluster.advance(Duration::from_millis(100));
    let connections = (0..NODES)
        .map(|node| (0..CONNECTIONS_PER_NODE).map(|_| cluster.connect(node)).collect())
        .collect();
    (cluster, connections)
}

/// Apply `ops`, returning the set of (node, slot, room) memberships.
fn apply(
    cluster: &mut SimCluster,
    connections: &[Vec<ConnectionId>],
    ops: &[Op],
) -> BTreeSet<(usize, usize, usize)> {
    let mut model = BTreeSet::new();
    for op in ops {
        match *op {
            Op::Join { node, slot, room } => {
                cluster.join(node, connections[node][slot], ROOMS[room]);
                model.insert((node, slot, room));
            },
            Op::Leave { node, slot, room } => {
                cluster.leave(node, connections[node][slot], ROOMS[room]);
                model.remove(&(node, slot, room));
            },
        }
        cluster.run_until_idle();
    }
    model
}

proptest! {
    #[test]
    fn lossless_cluster_agrees_on_totals(
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let (mut cluster, connections) = cluster_with_connections(seed);
        let model = apply(&mut cluster, &connections, &ops);
        cluster.advance(Duration::from_secs(1));

        for (r, room) in ROOMS.iter().enumerate() {
            let total = model.iter().filter(|(_, _, joined)| *joined == r).count() as u64;
            for node in 0..NODES {
                prop_assert_eq!(cluster.count(node, room), total, "node {} room {}", node, room);
            }
        }
    }

    #[test]
    fn survivor_falls_back_to_local_counts(
        seed in any::<u64>(),
        loss in 0.0f64..0.5,
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let (mut cluster, connections) = cluster_with_connections(seed);
        cluster.bus().set_loss_rate(loss);
        apply(&mut cluster, &connections, &ops);

        for node in 1..NODES {
            cluster.crash(node);
        }
        cluster.advance(Duration::from_secs(40));

        let presence = cluster.node(0).hub().presence().unwrap();
        prop_assert_eq!(presence.peer_count(), 0);
        for room in ROOMS {
            prop_assert_eq!(presence.count(room), presence.local_count(room));
        }
    }
}
