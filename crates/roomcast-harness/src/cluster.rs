//! Simulated multi-process cluster.
//!
//! Several [`HubDriver`]s share one [`SimBus`] and one virtual clock. The
//! cluster plays the role of every runtime at once: it routes bus deliveries,
//! executes hub actions, and runs scheduling passes. Nothing happens unless a
//! test calls [`SimCluster::run_until_idle`] or [`SimCluster::advance`], so
//! every interleaving is reproducible from the seed.

use std::{collections::BTreeMap, time::Duration};

use roomcast_core::{ConnectionId, ControlEvent, Environment, Transport};
use roomcast_server::{Command, HubAction, HubConfig, HubDriver, HubEvent, Scope};
use serde_json::Value;

use crate::{SimBus, SimEnv, SimTransport, sim_bus::BusStats};

/// Upper bound on passes in one [`SimCluster::run_until_idle`]. Reaching it
/// means two nodes keep waking each other up.
const MAX_PASSES: usize = 10_000;

/// One simulated process.
pub struct SimNode {
    hub: HubDriver<SimEnv, SimTransport>,
    transports: BTreeMap<ConnectionId, SimTransport>,
    next_connection: u64,
    online: bool,
}

impl SimNode {
    /// The node's hub driver.
    pub fn hub(&self) -> &HubDriver<SimEnv, SimTransport> {
        &self.hub
    }

    /// Whether the node is running.
    pub fn is_online(&self) -> bool {
        self.online
    }
}

/// A set of simulated processes on one bus.
pub struct SimCluster {
    env: SimEnv,
    bus: SimBus,
    nodes: Vec<SimNode>,
}

impl SimCluster {
    /// Create `size` nodes with default configuration. Nodes are not started.
    pub fn new(seed: u64, size: usize) -> Self {
        Self::with_config(seed, size, &HubConfig::default())
    }

    /// Create `size` nodes sharing `config`. Nodes are not started.
    pub fn with_config(seed: u64, size: usize, config: &HubConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let bus = SimBus::new(env.clone());
        let mut cluster = Self { env, bus, nodes: Vec::new() };
        for _ in 0..size {
            cluster.add_node(config.clone());
        }
        cluster
    }

    /// Add a node that is not started yet. Returns its index.
    pub fn add_node(&mut self, config: HubConfig) -> usize {
        self.nodes.push(SimNode {
            hub: HubDriver::new(self.env.clone(), config),
            transports: BTreeMap::new(),
            next_connection: 0,
            online: false,
        });
        self.nodes.len() - 1
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Shared bus.
    pub fn bus(&self) -> &SimBus {
        &self.bus
    }

    /// Node at `index`.
    pub fn node(&self, index: usize) -> &SimNode {
        &self.nodes[index]
    }

    /// Hub of node `index`, for installing handlers before it starts.
    pub fn hub_mut(&mut self, index: usize) -> &mut HubDriver<SimEnv, SimTransport> {
        &mut self.nodes[index].hub
    }

    /// Number of nodes, online or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.env.now()
    }

    /// Bus counters.
    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Start node `index`: attach it to the bus and announce presence.
    pub fn start(&mut self, index: usize) {
        self.nodes[index].online = true;
        let actions = self.nodes[index].hub.start();
        self.execute(index, actions);
    }

    /// Start every node, in index order.
    pub fn start_all(&mut self) {
        for index in 0..self.nodes.len() {
            self.start(index);
        }
    }

    /// Graceful shutdown: `stop` is published, then the node goes silent.
    pub fn stop(&mut self, index: usize) {
        let actions = self.nodes[index].hub.shutdown();
        self.execute(index, actions);
        self.take_offline(index);
    }

    /// Crash: the node disappears without a word.
    pub fn crash(&mut self, index: usize) {
        tracing::debug!(node = index, "crashing node");
        self.take_offline(index);
    }

    /// Open a connection on node `index`.
    pub fn connect(&mut self, index: usize) -> ConnectionId {
        let node = &mut self.nodes[index];
        node.next_connection += 1;
        let connection = ConnectionId(node.next_connection);
        let transport = SimTransport::new(connection);
        node.transports.insert(connection, transport.clone());
        self.event(index, HubEvent::ConnectionAccepted { connection, transport });
        connection
    }

    /// Close a connection from the client side.
    pub fn disconnect(&mut self, index: usize, connection: ConnectionId) {
        if let Some(transport) = self.nodes[index].transports.get(&connection) {
            transport.fire(ControlEvent::Close, None);
        }
        let reason = "client disconnected".to_string();
        self.event(index, HubEvent::ConnectionClosed { connection, reason });
    }

    /// Deliver a raw text frame from a connection.
    pub fn send_frame(&mut self, index: usize, connection: ConnectionId, frame: &Value) {
        self.event(index, HubEvent::FrameReceived { connection, frame: frame.to_string() });
    }

    /// Apply a socket command on node `index`.
    pub fn command(&mut self, index: usize, command: Command) {
        self.event(index, HubEvent::Command(command));
    }

    /// Join `room` for broadcasts and presence.
    pub fn join(&mut self, index: usize, connection: ConnectionId, room: &str) {
        let room = room.to_string();
        self.command(index, Command::Join { connection, room, scope: Scope::Both });
    }

    /// Leave `room`.
    pub fn leave(&mut self, index: usize, connection: ConnectionId, room: &str) {
        let room = room.to_string();
        self.command(index, Command::Leave { connection, room, scope: Scope::Both });
    }

    /// Stream `room`'s presence count to `connection` as `room` events.
    pub fn watch(&mut self, index: usize, connection: ConnectionId, room: &str) {
        let (room, key) = (room.to_string(), room.to_string());
        self.command(index, Command::SubscribePresence { connection, room, key });
    }

    /// Broadcast from node `index`.
    pub fn broadcast(&mut self, index: usize, room: &str, event_name: &str, data: Value) {
        let actions = self.nodes[index].hub.broadcast(room, event_name, data);
        self.execute(index, actions);
    }

    /// Transport of `connection` on node `index`.
    ///
    /// # Panics
    ///
    /// If the connection was never opened.
    #[allow(clippy::expect_used)]
    pub fn transport(&self, index: usize, connection: ConnectionId) -> &SimTransport {
        self.nodes[index].transports.get(&connection).expect("connection was opened")
    }

    /// Aggregate presence count of `room` on node `index`.
    pub fn count(&self, index: usize, room: &str) -> u64 {
        self.nodes[index].hub.presence().map_or(0, |presence| presence.count(room))
    }

    /// Deliver queued bus traffic and run due work until nothing is left at
    /// the current instant.
    pub fn run_until_idle(&mut self) {
        for _ in 0..MAX_PASSES {
            let mut progressed = false;

            while let Some(delivery) = self.bus.pop() {
                progressed = true;
                if !self.nodes[delivery.node].online {
                    continue;
                }
                let event =
                    HubEvent::BusMessage { channel: delivery.channel, payload: delivery.payload };
                self.event(delivery.node, event);
            }

            let now = self.env.now();
            for index in 0..self.nodes.len() {
                let node = &self.nodes[index];
                let due = node.online && node.hub.next_deadline().is_some_and(|at| at <= now);
                if due {
                    progressed = true;
                    self.event(index, HubEvent::Tick);
                }
            }

            if !progressed {
                return;
            }
        }
        tracing::warn!(passes = MAX_PASSES, "cluster did not settle");
    }

    /// Advance virtual time by `by`, stopping at every deadline on the way
    /// so timers fire at their exact instant.
    pub fn advance(&mut self, by: Duration) {
        let target = self.env.now() + by;
        self.run_until_idle();
        loop {
            let next = self
                .nodes
                .iter()
                .filter(|node| node.online)
                .filter_map(|node| node.hub.next_deadline())
                .min();
            match next {
                Some(at) if at <= target => {
                    self.env.advance_to(at);
                    self.run_until_idle();
                },
                _ => break,
            }
        }
        self.env.advance_to(target);
        self.run_until_idle();
    }

    fn take_offline(&mut self, index: usize) {
        self.nodes[index].online = false;
        self.bus.detach(index);
    }

    fn event(&mut self, index: usize, event: HubEvent<SimTransport>) {
        match self.nodes[index].hub.process_event(event) {
            Ok(actions) => self.execute(index, actions),
            Err(err) => tracing::debug!(node = index, %err, "event rejected"),
        }
    }

    fn execute(&mut self, index: usize, actions: Vec<HubAction>) {
        if !self.nodes[index].online {
            return;
        }
        let endpoint = self.bus.endpoint(index);
        let mut closed = Vec::new();
        for action in actions {
            match action {
                HubAction::Bus(action) => action.apply(&endpoint),
                HubAction::Close { connection, reason } => {
                    tracing::debug!(node = index, %connection, %reason, "closing connection");
                    if let Some(transport) = self.nodes[index].transports.get(&connection) {
                        transport.close();
                    }
                    closed.push(connection);
                },
            }
        }
        for connection in closed {
            self.disconnect(index, connection);
        }
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster")
            .field("now", &self.env.now())
            .field("nodes", &self.nodes.len())
            .field("bus", &self.bus)
            .finish()
    }
}
