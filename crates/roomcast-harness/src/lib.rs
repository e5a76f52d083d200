//! Deterministic simulation harness for roomcast.
//!
//! Virtual-time implementations of the Environment, Bus and Transport
//! collaborators, plus [`SimCluster`], which runs several hubs against one
//! simulated bus. Every run is reproducible from its seed: time moves only
//! when a test advances it, bus deliveries happen in a fixed order, and
//! message loss is drawn from the seeded RNG.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod sim_bus;
pub mod sim_env;
pub mod sim_transport;

pub use cluster::{SimCluster, SimNode};
pub use sim_bus::{BusStats, Delivery, SimBus, SimBusEndpoint};
pub use sim_env::SimEnv;
pub use sim_transport::SimTransport;
