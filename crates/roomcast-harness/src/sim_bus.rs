//! Deterministic in-memory bus.
//!
//! Publishes are queued, not delivered inline, so the cluster decides when a
//! node sees a message. The queue is global FIFO, which gives per-channel
//! ordering. An optional loss rate drops individual deliveries using the
//! simulation RNG.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use roomcast_core::Bus;

use crate::SimEnv;

/// One queued delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Receiving node index
    pub node: usize,
    /// Channel
    pub channel: String,
    /// Raw payload
    pub payload: String,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Publish calls
    pub published: u64,
    /// Deliveries queued
    pub queued: u64,
    /// Deliveries dropped by fault injection
    pub dropped: u64,
}

struct BusState {
    subscriptions: HashMap<String, BTreeSet<usize>>,
    queue: VecDeque<Delivery>,
    loss_rate: f64,
    stats: BusStats,
}

/// Shared simulated bus.
#[derive(Clone)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
    env: SimEnv,
}

impl SimBus {
    /// Create a lossless bus drawing randomness from `env`.
    pub fn new(env: SimEnv) -> Self {
        let state = BusState {
            subscriptions: HashMap::new(),
            queue: VecDeque::new(),
            loss_rate: 0.0,
            stats: BusStats::default(),
        };
        Self { state: Arc::new(Mutex::new(state)), env }
    }

    /// Drop each delivery with probability `rate`.
    pub fn set_loss_rate(&self, rate: f64) {
        self.lock().loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Endpoint through which node `node` talks to the bus.
    pub fn endpoint(&self, node: usize) -> SimBusEndpoint {
        SimBusEndpoint { bus: self.clone(), node }
    }

    /// Take the next queued delivery.
    pub fn pop(&self) -> Option<Delivery> {
        self.lock().queue.pop_front()
    }

    /// Whether deliveries are queued.
    pub fn is_idle(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Drop every subscription of `node` and its queued deliveries.
    pub fn detach(&self, node: usize) {
        let mut state = self.lock();
        for subscribers in state.subscriptions.values_mut() {
            subscribers.remove(&node);
        }
        state.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        state.queue.retain(|delivery| delivery.node != node);
    }

    /// Whether `node` is subscribed to `channel`.
    pub fn is_subscribed(&self, node: usize, channel: &str) -> bool {
        self.lock().subscriptions.get(channel).is_some_and(|nodes| nodes.contains(&node))
    }

    /// Counters so far.
    pub fn stats(&self) -> BusStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SimBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBus").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

/// One node's view of the [`SimBus`].
#[derive(Debug, Clone)]
pub struct SimBusEndpoint {
    bus: SimBus,
    node: usize,
}

impl Bus for SimBusEndpoint {
    fn publish(&self, channel: &str, payload: &str) {
        let mut state = self.bus.lock();
        state.stats.published += 1;
        let targets: Vec<usize> = state
            .subscriptions
            .get(channel)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default();

        for node in targets {
            if state.loss_rate > 0.0 && self.bus.env.random_unit() < state.loss_rate {
                state.stats.dropped += 1;
                tracing::trace!(channel, node, "delivery dropped");
                continue;
            }
            state.stats.queued += 1;
            state.queue.push_back(Delivery {
                node,
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    fn subscribe(&self, channel: &str) {
        self.bus.lock().subscriptions.entry(channel.to_string()).or_default().insert(self.node);
    }

    fn unsubscribe(&self, channel: &str) {
        let mut state = self.bus.lock();
        if let Some(nodes) = state.subscriptions.get_mut(channel) {
            nodes.remove(&self.node);
            if nodes.is_empty() {
                state.subscriptions.remove(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliveries_queue_in_publish_order() {
        let bus = SimBus::new(SimEnv::new());
        let (a, b) = (bus.endpoint(0), bus.endpoint(1));
        a.subscribe("c");
        b.subscribe("c");

        a.publish("c", "1");
        b.publish("c", "2");

        let order: Vec<(usize, String)> =
            std::iter::from_fn(|| bus.pop()).map(|d| (d.node, d.payload)).collect();
        assert_eq!(
            order,
            vec![(0, "1".into()), (1, "1".into()), (0, "2".into()), (1, "2".into())]
        );
    }

    #[test]
    fn full_loss_drops_everything() {
        let bus = SimBus::new(SimEnv::with_seed(3));
        bus.set_loss_rate(1.0);
        let a = bus.endpoint(0);
        a.subscribe("c");
        a.publish("c", "x");

        assert!(bus.is_idle());
        assert_eq!(bus.stats(), BusStats { published: 1, queued: 0, dropped: 1 });
    }

    #[test]
    fn detach_forgets_node() {
        let bus = SimBus::new(SimEnv::new());
        let a = bus.endpoint(0);
        a.subscribe("c");
        a.publish("c", "x");

        bus.detach(0);
        assert!(bus.is_idle());
        assert!(!bus.is_subscribed(0, "c"));
    }
}
