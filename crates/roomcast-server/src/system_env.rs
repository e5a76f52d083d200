//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` uses the real monotonic clock, tokio's sleep, and OS entropy.
//! Production behavior is therefore non-deterministic; the harness supplies
//! the reproducible counterpart.

use std::time::Duration;

use roomcast_core::Environment;

/// Production environment using system time and OS randomness.
///
/// Instance identifiers are drawn from getrandom, so two processes started in
/// the same instant still get distinct ids.
///
/// # Panics
///
/// Panics if the OS RNG fails. Without entropy two instances could share an
/// id and discard each other's traffic as their own.
#[derive(Clone, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use roomcast_core::InstanceId;

    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn system_env_time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1, "Time should advance");
    }

    #[test]
    fn instance_ids_differ() {
        let env = SystemEnv::new();
        assert_ne!(InstanceId::generate(&env), InstanceId::generate(&env));
    }

    #[tokio::test]
    async fn system_env_sleep_works() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(50)).await;
        let elapsed = env.now() - start;

        assert!(elapsed >= Duration::from_millis(50), "Sleep should wait at least 50ms");
    }
}
