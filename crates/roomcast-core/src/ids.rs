//! Identifiers shared by the registry, the presence coordinator and the
//! gateway.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::env::Environment;

/// Identity of a live connection within one process.
///
/// Assigned by the gateway when the connection is accepted. Components never
/// own connections; they keep side-tables keyed by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of a registry or presence coordinator instance on the bus.
///
/// Drawn once at construction. Rendered as 32 lowercase hex characters, which
/// is also its wire form (`clientId`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Draw a fresh random identifier from the environment.
    pub fn generate<E: Environment>(env: &E) -> Self {
        Self(format!("{:032x}", env.random_u128()))
    }

    /// Wrap an identifier received from the wire.
    pub fn from_wire(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Wire form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use rand::{RngCore, SeedableRng, rngs::StdRng};

    use super::*;

    #[derive(Clone)]
    struct SeededEnv(Arc<Mutex<StdRng>>);

    impl Environment for SeededEnv {
        type Instant = Instant;

        #[allow(clippy::disallowed_methods)]
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.0.lock().unwrap().fill_bytes(buffer);
        }
    }

    #[test]
    fn generated_ids_are_32_hex_chars_and_seed_stable() {
        let env = |seed| SeededEnv(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))));

        let id = InstanceId::generate(&env(1));
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert_eq!(InstanceId::generate(&env(1)), id);
        assert_ne!(InstanceId::generate(&env(2)), id);
    }

    #[test]
    fn instance_id_wire_form_is_transparent() {
        let id = InstanceId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");

        let back: InstanceId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn connection_ids_order_numerically() {
        assert!(ConnectionId(2) < ConnectionId(10));
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }
}
