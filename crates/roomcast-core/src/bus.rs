//! Publish/subscribe bus contract.
//!
//! The bus connects processes. It is assumed to deliver messages on one
//! channel in send order, with no exactly-once guarantee. The state machines
//! in this crate never hold a bus; they return [`BusAction`]s and the driver
//! applies them.

/// The inter-process publish/subscribe collaborator.
///
/// All operations are fire-and-forget. A bus that fails owns its own retry
/// policy; the core never learns about it.
pub trait Bus {
    /// Publish `payload` on `channel`.
    fn publish(&self, channel: &str, payload: &str);

    /// Start receiving messages on `channel`.
    fn subscribe(&self, channel: &str);

    /// Stop receiving messages on `channel`.
    fn unsubscribe(&self, channel: &str);
}

/// A bus operation requested by a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAction {
    /// Subscribe to a channel
    Subscribe {
        /// Channel name
        channel: String,
    },
    /// Unsubscribe from a channel
    Unsubscribe {
        /// Channel name
        channel: String,
    },
    /// Publish a payload
    Publish {
        /// Channel name
        channel: String,
        /// Encoded JSON payload
        payload: String,
    },
}

impl BusAction {
    /// Channel the action targets.
    pub fn channel(&self) -> &str {
        match self {
            Self::Subscribe { channel } | Self::Unsubscribe { channel } => channel,
            Self::Publish { channel, .. } => channel,
        }
    }

    /// Execute against a bus.
    pub fn apply<B: Bus + ?Sized>(&self, bus: &B) {
        match self {
            Self::Subscribe { channel } => bus.subscribe(channel),
            Self::Unsubscribe { channel } => bus.unsubscribe(channel),
            Self::Publish { channel, payload } => bus.publish(channel, payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct Tape(RefCell<Vec<String>>);

    impl Bus for Tape {
        fn publish(&self, channel: &str, payload: &str) {
            self.0.borrow_mut().push(format!("pub {channel} {payload}"));
        }

        fn subscribe(&self, channel: &str) {
            self.0.borrow_mut().push(format!("sub {channel}"));
        }

        fn unsubscribe(&self, channel: &str) {
            self.0.borrow_mut().push(format!("unsub {channel}"));
        }
    }

    #[test]
    fn apply_dispatches_each_operation() {
        let tape = Tape::default();
        let actions = [
            BusAction::Subscribe { channel: "a".into() },
            BusAction::Publish { channel: "a".into(), payload: "{}".into() },
            BusAction::Unsubscribe { channel: "a".into() },
        ];
        for action in &actions {
            assert_eq!(action.channel(), "a");
            action.apply(&tape);
        }
        assert_eq!(*tape.0.borrow(), vec!["sub a", "pub a {}", "unsub a"]);
    }
}
