//! Simulated Environment implementation with a virtual clock.
//!
//! `SimEnv` provides deterministic time and randomness. Time starts at zero
//! and only moves when [`SimEnv::advance`] (or `sleep`) is called; all clones
//! share the same clock and RNG, so every node of a cluster sees one timeline.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use roomcast_core::Environment;

/// Simulation environment using virtual time and a seeded RNG.
///
/// Instants are offsets from the start of the simulation.
#[derive(Clone)]
pub struct SimEnv {
    clock: Arc<Mutex<Duration>>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Create a simulation environment with seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Create a simulation environment with a specific RNG seed.
    ///
    /// Same seed, same sequence of instance ids.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            clock: Arc::new(Mutex::new(Duration::ZERO)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        *clock += by;
    }

    /// Move the clock to `at`. Never moves it backwards.
    pub fn advance_to(&self, at: Duration) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        if at > *clock {
            *clock = at;
        }
    }

    /// Draw a float in `[0, 1)` from the shared RNG.
    pub fn random_unit(&self) -> f64 {
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("now", &self.now()).finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    type Instant = Duration;

    fn now(&self) -> Self::Instant {
        *self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
