//! # RTS Net
//!
//! Lockstep networking for [`rts_core`].
//!
//! A match has one server and one client per player slot. Clients send the
//! commands their player issues, tagged for a future tick. The server folds
//! them into sealed ticks and only seals the next tick once every connected
//! client acknowledged the previous one with its state checksum. Clients
//! never advance past the last sealed tick, so every peer applies the same
//! commands on the same tick.
//!
//! ## Crate Structure
//!
//! - [`protocol`] - Versioned wire format
//! - [`transport`] - Framed async reads and writes
//! - [`barrier`] - Tick sealing, acknowledgements, disconnect policy
//! - [`server`] - Lobby and match loop
//! - [`client`] - Client state machine and connection
//! - [`config`] - RON server configuration

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod barrier;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::barrier::{BarrierEvent, DisconnectPolicy, LockstepBarrier, SlotState};
    pub use crate::client::{ClientConnection, ClientEvent, LockstepClient, SessionInfo};
    pub use crate::config::{Placement, Scenario, ServerConfig};
    pub use crate::error::{NetError, Result};
    pub use crate::protocol::{AbortReason, NetworkMessage, PROTOCOL_VERSION};
    pub use crate::server::{LockstepServer, MatchOutcome};
}
