//! Durable client session state
//!
//! - [`store`] - in-flight messages, inbound QoS 2 tracking and subscriptions
//! - [`packet_id`] - packet identifier allocation

pub mod packet_id;
pub mod store;

pub use packet_id::PacketIdAllocator;
pub use store::{
    AckKind, AckResult, InFlight, InboundState, InboundStatus, OutboundMessage, OutboundState,
    SessionStore,
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No in-flight message with packet id {0}")]
    UnknownId(u16),

    #[error("Unexpected {kind:?} for packet id {packet_id} in state {state:?}")]
    UnexpectedAck {
        packet_id: u16,
        kind: AckKind,
        state: OutboundState,
    },

    #[error("All 65535 packet identifiers are in flight")]
    PacketIdsExhausted,

    #[error("Packet id {0} is already in flight")]
    IdInUse(u16),

    #[error("QoS 0 message {0} cannot be tracked")]
    NotTracked(u16),
}
