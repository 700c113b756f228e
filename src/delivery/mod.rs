//! Delivery manager
//!
//! Enforces the per-QoS delivery contracts on top of the [`SessionStore`]:
//!
//! - QoS 0 publishes are handed to the connection and forgotten
//! - QoS 1/2 publishes are recorded before they are written and resolved
//!   exactly once, when the final acknowledgement arrives
//! - inbound QoS 2 messages are delivered once no matter how often the broker
//!   retransmits them
//!
//! The manager never touches the network. Each handler returns the packets the
//! caller must write, which keeps the whole flow testable without a broker.

use crate::error::ClientError;
use crate::observability::metrics::ClientMetrics;
use crate::protocol::{Ack, Packet, ProtocolVersion, Publish, QoS};
use crate::session::{
    AckKind, AckResult, InFlight, InboundStatus, OutboundMessage, OutboundState, SessionError,
    SessionStore,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resolves a publish call once its flow completes.
pub type Completion = oneshot::Sender<Result<(), ClientError>>;

/// v5 reason code sent back for identifiers we do not know
const PACKET_ID_NOT_FOUND: u8 = 0x92;

/// What to do with an inbound PUBLISH.
#[derive(Debug, Default, PartialEq)]
pub struct InboundOutcome {
    /// Acknowledgement to write back, if any
    pub reply: Option<Packet>,
    /// Message to hand to the application, if any
    pub deliver: Option<Publish>,
}

/// Read-only view of an outbound message still in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightSummary {
    pub packet_id: u16,
    pub topic: String,
    pub qos: u8,
    pub state: OutboundState,
    pub attempts: u32,
}

impl From<&InFlight> for InFlightSummary {
    fn from(entry: &InFlight) -> Self {
        Self {
            packet_id: entry.packet_id,
            topic: entry.message.topic.clone(),
            qos: entry.message.qos.into(),
            state: entry.state,
            attempts: entry.attempts,
        }
    }
}

struct Waiter {
    completion: Option<Completion>,
    first_written: Option<Instant>,
}

pub struct DeliveryManager {
    store: SessionStore,
    waiters: HashMap<u16, Waiter>,
    version: ProtocolVersion,
    metrics: Arc<ClientMetrics>,
}

impl std::fmt::Debug for DeliveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryManager")
            .field("version", &self.version)
            .field("outbound", &self.store.outbound_len())
            .field("inbound", &self.store.inbound_len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

impl DeliveryManager {
    pub fn new(version: ProtocolVersion, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            store: SessionStore::new(),
            waiters: HashMap::new(),
            version,
            metrics,
        }
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SessionStore {
        &mut self.store
    }

    /// Starts an outbound publish and returns the PUBLISH to write.
    ///
    /// QoS 0 resolves `completion` immediately. For QoS 1/2 the message is
    /// recorded first; if no packet identifier is free the completion is
    /// rejected and `None` is returned.
    pub fn begin_publish(
        &mut self,
        message: OutboundMessage,
        completion: Option<Completion>,
    ) -> Option<Packet> {
        if message.qos == QoS::AtMostOnce {
            let packet = publish_packet(&message, None, false);
            resolve(completion, Ok(()));
            return Some(packet);
        }

        let packet_id = match self.store.allocate_packet_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Cannot publish: no packet id available");
                self.metrics.publish_failed();
                resolve(completion, Err(e.into()));
                return None;
            }
        };

        let packet = publish_packet(&message, Some(packet_id), false);
        if let Err(e) = self.store.record_outbound(packet_id, message) {
            self.metrics.publish_failed();
            resolve(completion, Err(e.into()));
            return None;
        }
        debug!(target: "mqtt_client", packet_id, "Recorded outbound publish");
        self.waiters.insert(
            packet_id,
            Waiter {
                completion,
                first_written: None,
            },
        );
        Some(packet)
    }

    /// Bookkeeping after `packet` was written to the transport.
    pub fn on_written(&mut self, packet: &Packet) {
        let Packet::Publish(publish) = packet else {
            return;
        };
        self.metrics.message_published();
        let Some(packet_id) = publish.packet_id else {
            return;
        };

        self.store.mark_written(packet_id);
        let retransmitted = self
            .store
            .outbound()
            .find(|entry| entry.packet_id == packet_id)
            .is_some_and(|entry| entry.attempts > 1);
        if retransmitted {
            self.metrics.message_retransmitted();
        }
        if let Some(waiter) = self.waiters.get_mut(&packet_id) {
            waiter.first_written.get_or_insert_with(Instant::now);
        }
    }

    /// Handles an inbound PUBLISH.
    pub fn on_publish(&mut self, publish: Publish) -> InboundOutcome {
        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) | (_, None) => {
                self.metrics.message_received();
                return InboundOutcome {
                    reply: None,
                    deliver: Some(publish),
                };
            }
            (_, Some(id)) => id,
        };

        if publish.qos == QoS::AtLeastOnce {
            self.metrics.message_received();
            return InboundOutcome {
                reply: Some(Packet::PubAck(Ack::new(packet_id))),
                deliver: Some(publish),
            };
        }

        let reply = Some(Packet::PubRec(Ack::new(packet_id)));
        match self.store.record_inbound_qos2(packet_id) {
            InboundStatus::New => {
                self.store.mark_inbound_acknowledged(packet_id);
                self.metrics.message_received();
                InboundOutcome {
                    reply,
                    deliver: Some(publish),
                }
            }
            InboundStatus::Duplicate => {
                debug!(target: "mqtt_client", packet_id, "Suppressing redelivered QoS 2 message");
                self.metrics.duplicate_suppressed();
                InboundOutcome {
                    reply,
                    deliver: None,
                }
            }
        }
    }

    /// Handles PUBREL for an inbound QoS 2 message and returns the PUBCOMP.
    pub fn on_pubrel(&mut self, ack: &Ack) -> Packet {
        let mut pubcomp = Ack::new(ack.packet_id);
        if !self.store.complete_inbound_qos2(ack.packet_id) {
            debug!(target: "mqtt_client", packet_id = ack.packet_id, "PUBREL for unknown packet id");
            if self.version.is_v5() {
                pubcomp.reason_code = PACKET_ID_NOT_FOUND;
            }
        }
        Packet::PubComp(pubcomp)
    }

    pub fn on_puback(&mut self, ack: &Ack) {
        match self.store.ack_outbound(ack.packet_id, AckKind::PubAck) {
            Ok(AckResult::Completed(message)) => self.complete(ack, &message),
            Ok(AckResult::AwaitingPubcomp) => {}
            Err(e) => ignore_ack(ack, &e),
        }
    }

    /// Handles PUBREC and returns the PUBREL to write, if the flow continues.
    pub fn on_pubrec(&mut self, ack: &Ack) -> Option<Packet> {
        if ack.reason_code >= 0x80 {
            // A failed PUBREC ends the exchange; no PUBREL follows
            if let Some(entry) = self.store.remove_outbound(ack.packet_id) {
                self.complete(ack, &entry.message);
            }
            return None;
        }

        match self.store.ack_outbound(ack.packet_id, AckKind::PubRec) {
            Ok(_) => Some(Packet::PubRel(Ack::new(ack.packet_id))),
            Err(SessionError::UnknownId(packet_id)) => {
                debug!(target: "mqtt_client", packet_id, "PUBREC for unknown packet id");
                let mut pubrel = Ack::new(packet_id);
                if self.version.is_v5() {
                    pubrel.reason_code = PACKET_ID_NOT_FOUND;
                }
                Some(Packet::PubRel(pubrel))
            }
            Err(e) => {
                ignore_ack(ack, &e);
                None
            }
        }
    }

    pub fn on_pubcomp(&mut self, ack: &Ack) {
        match self.store.ack_outbound(ack.packet_id, AckKind::PubComp) {
            Ok(AckResult::Completed(message)) => self.complete(ack, &message),
            Ok(AckResult::AwaitingPubcomp) => {}
            Err(e) => ignore_ack(ack, &e),
        }
    }

    fn complete(&mut self, ack: &Ack, message: &OutboundMessage) {
        let waiter = self.waiters.remove(&ack.packet_id);
        let result = if ack.reason_code >= 0x80 {
            warn!(
                packet_id = ack.packet_id,
                topic = %message.topic,
                code = ack.reason_code,
                "Broker rejected publish"
            );
            self.metrics.publish_failed();
            Err(ClientError::Rejected {
                operation: "publish",
                filter: message.topic.clone(),
                code: ack.reason_code,
            })
        } else {
            let latency = waiter
                .as_ref()
                .and_then(|w| w.first_written)
                .map(|at| at.elapsed())
                .unwrap_or_default();
            self.metrics.message_acknowledged(latency);
            Ok(())
        };
        debug!(target: "mqtt_client", packet_id = ack.packet_id, "Outbound flow complete");
        if let Some(waiter) = waiter {
            resolve(waiter.completion, result);
        }
    }

    /// Packets that resume every unfinished outbound flow, in original send order.
    pub fn resume(&self) -> Vec<Packet> {
        self.store
            .outbound()
            .map(|entry| match entry.state {
                OutboundState::Sent => publish_packet(&entry.message, Some(entry.packet_id), false),
                OutboundState::AwaitPuback | OutboundState::AwaitPubrec => {
                    publish_packet(&entry.message, Some(entry.packet_id), true)
                }
                OutboundState::AwaitPubcomp => Packet::PubRel(Ack::new(entry.packet_id)),
            })
            .collect()
    }

    /// Discards the whole session and rejects every waiter with `error`.
    pub fn reset_session(&mut self, error: ClientError) {
        if self.store.has_state() || !self.waiters.is_empty() {
            self.metrics.session_lost();
        }
        self.store.clear();
        self.reject_all(error);
    }

    /// Rejects every waiter but keeps the in-flight records.
    pub fn fail_waiters(&mut self, error: ClientError) {
        for waiter in self.waiters.values_mut() {
            resolve(waiter.completion.take(), Err(error.clone()));
        }
    }

    /// Gives up on every outbound in-flight message; returns how many were dropped.
    pub fn abandon(&mut self) -> usize {
        let dropped = self.store.take_outbound();
        for entry in &dropped {
            if let Some(waiter) = self.waiters.remove(&entry.packet_id) {
                resolve(waiter.completion, Err(ClientError::Abandoned));
            }
        }
        self.reject_all(ClientError::Abandoned);
        dropped.len()
    }

    pub fn in_flight(&self) -> Vec<InFlightSummary> {
        self.store.outbound().map(InFlightSummary::from).collect()
    }

    fn reject_all(&mut self, error: ClientError) {
        for (_, waiter) in self.waiters.drain() {
            resolve(waiter.completion, Err(error.clone()));
        }
    }
}

fn publish_packet(message: &OutboundMessage, packet_id: Option<u16>, dup: bool) -> Packet {
    Packet::Publish(Publish {
        dup,
        qos: message.qos,
        retain: message.retain,
        topic: message.topic.clone(),
        packet_id,
        payload: message.payload.clone(),
        properties: message.properties.clone(),
    })
}

fn resolve(completion: Option<Completion>, result: Result<(), ClientError>) {
    if let Some(completion) = completion {
        // The caller may have stopped waiting
        let _ = completion.send(result);
    }
}

fn ignore_ack(ack: &Ack, error: &SessionError) {
    warn!(packet_id = ack.packet_id, error = %error, "Ignoring acknowledgement");
}
