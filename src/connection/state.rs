//! Pure connection state transitions
//!
//! One physical connection moves Disconnected -> Connecting -> Connected ->
//! Disconnecting -> Disconnected. Any failure lands in `Failed`, which is
//! terminal for that attempt and handed to the reconnect supervisor.

use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Attempt ended abnormally; carries the reason
    Failed(String),
}

/// Inputs that drive [`ConnectionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport opened and CONNECT written
    Opened,
    ConnAckAccepted,
    ConnAckRefused(String),
    Timeout,
    KeepAliveExpired,
    ProtocolViolation(String),
    TransportError(String),
    /// Peer closed the byte stream
    Closed,
    DisconnectRequested,
}

impl ConnectionState {
    /// Next state for `event`, or `None` when the event is meaningless in this state.
    pub fn next(&self, event: &ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self, event) {
            (S::Disconnected | S::Failed(_), E::Opened) => S::Connecting,
            (S::Connecting, E::ConnAckAccepted) => S::Connected,
            (S::Connecting, E::ConnAckRefused(reason)) => S::Failed(reason.clone()),
            (S::Connecting, E::Timeout) => S::Failed("timed out waiting for CONNACK".to_string()),
            (S::Connected, E::KeepAliveExpired) => {
                S::Failed("broker did not answer PINGREQ".to_string())
            }
            (S::Connecting | S::Connected, E::ProtocolViolation(reason)) => {
                S::Failed(format!("protocol error: {reason}"))
            }
            (S::Connecting | S::Connected, E::TransportError(reason)) => {
                S::Failed(format!("transport error: {reason}"))
            }
            (S::Connecting | S::Connected, E::Closed) => {
                S::Failed("connection closed by broker".to_string())
            }
            (S::Connecting, E::DisconnectRequested) => S::Disconnected,
            (S::Connected, E::DisconnectRequested) => S::Disconnecting,
            (S::Disconnecting, E::Closed | E::TransportError(_)) => S::Disconnected,
            _ => return None,
        };
        Some(next)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

/// Logs a state change at a level matching its severity.
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("MQTT connection established");
        }
        (_, ConnectionState::Failed(reason)) => {
            warn!(reason = %reason, "MQTT connection failed");
        }
        (ConnectionState::Disconnecting, ConnectionState::Disconnected) => {
            info!("MQTT connection closed cleanly");
        }
        _ => {
            debug!(target: "mqtt_client", "Connection state: {:?} -> {:?}", from, to);
        }
    }
}
