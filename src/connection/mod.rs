//! Connection state machine
//!
//! - [`state`] - pure transitions of a single connection attempt
//! - [`keepalive`] - PINGREQ scheduling and broker liveness
//! - [`link`] - the live transport with CONNECT/CONNACK handshake

pub mod keepalive;
pub mod link;
pub mod state;

pub use keepalive::{KeepAlive, KeepAliveAction};
pub use link::{Link, LinkParams};
pub use state::{log_state_transition, ConnectionEvent, ConnectionState};
