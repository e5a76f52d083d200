//! Roomcast core: room membership and distributed presence as pure state
//! machines.
//!
//! # Architecture
//!
//! Everything in this crate follows the Sans-IO pattern. Components take the
//! current time as an argument and return actions; a driver executes them
//! against real (or simulated) I/O.
//!
//! ```text
//!            ┌──────────────┐  Deliver   ┌──────────────┐
//!  frames ──►│ Multiplexer  │◄───────────│ RoomRegistry │◄──┐
//!            └──────────────┘            └──────────────┘   │ bus messages
//!                                        ┌──────────────┐   │
//!   join/leave ─────────────────────────►│   Presence   │◄──┘
//!                                        │ Coordinator  │──► BusAction
//!                                        └──────────────┘
//! ```
//!
//! # Components
//!
//! - [`Batched`]: coalesces calls made within one scheduling window
//! - [`Multiplexer`]: event streams and request/response over one connection
//! - [`RoomRegistry`]: local membership mirrored across processes
//! - [`PresenceCoordinator`]: eventually consistent participant counts
//! - [`Environment`]: injectable time and randomness

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod bus;
pub mod env;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod multiplexer;
pub mod presence;
pub mod registry;

pub use batch::{Batched, Window};
pub use bus::{Bus, BusAction};
pub use env::{Environment, Timestamp};
pub use envelope::{Envelope, ResponseEnvelope};
pub use error::ProtocolError;
pub use ids::{ConnectionId, InstanceId};
pub use multiplexer::{ControlEvent, ControlHandler, Multiplexer, Responder, Transport};
pub use presence::{
    PresenceCallback, PresenceConfig, PresenceCoordinator, PresenceKind, PresenceMessage,
    PresenceSubscription,
};
pub use registry::{RegistryAction, RegistryConfig, RoomBroadcast, RoomRegistry};
