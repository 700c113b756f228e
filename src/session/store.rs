//! Client-side session state
//!
//! Holds everything that must outlive a single connection: outbound QoS 1/2
//! messages that are not fully acknowledged (kept in original send order),
//! inbound QoS 2 identifiers awaiting PUBREL, active subscriptions and the
//! packet identifier allocator. The store has exactly one owner, the client's
//! event loop, so nothing here locks.

use super::packet_id::PacketIdAllocator;
use super::SessionError;
use crate::protocol::{Properties, QoS};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// Progress of an outbound QoS 1/2 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundState {
    /// Recorded but not yet written to any connection
    Sent,
    AwaitPuback,
    AwaitPubrec,
    AwaitPubcomp,
}

/// Progress of an inbound QoS 2 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundState {
    Received,
    AwaitPubrel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckKind {
    PubAck,
    PubRec,
    PubComp,
}

/// Application message as the publisher handed it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            properties: Properties::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub packet_id: u16,
    pub message: OutboundMessage,
    pub state: OutboundState,
    /// Number of times the PUBLISH has been written
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResult {
    /// The flow finished; the message left the store
    Completed(OutboundMessage),
    /// PUBREC accepted, PUBREL must be sent
    AwaitingPubcomp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStatus {
    New,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    packet_ids: PacketIdAllocator,
    outbound: VecDeque<InFlight>,
    inbound_qos2: HashMap<u16, InboundState>,
    subscriptions: BTreeMap<String, QoS>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an identifier that no outbound message or pending request is using.
    pub fn allocate_packet_id(&mut self) -> Result<u16, SessionError> {
        self.packet_ids.allocate()
    }

    /// Returns an identifier reserved for a SUBSCRIBE/UNSUBSCRIBE that has finished.
    pub fn release_packet_id(&mut self, packet_id: u16) {
        if self.find(packet_id).is_none() {
            self.packet_ids.release(packet_id);
        }
    }

    pub fn record_outbound(
        &mut self,
        packet_id: u16,
        message: OutboundMessage,
    ) -> Result<(), SessionError> {
        if self.find(packet_id).is_some() {
            return Err(SessionError::IdInUse(packet_id));
        }
        if message.qos == QoS::AtMostOnce {
            return Err(SessionError::NotTracked(packet_id));
        }
        // Identifiers normally come from allocate_packet_id; reserve covers restored records
        self.packet_ids.reserve(packet_id);
        self.outbound.push_back(InFlight {
            packet_id,
            message,
            state: OutboundState::Sent,
            attempts: 0,
        });
        Ok(())
    }

    /// Notes that the PUBLISH for `packet_id` went out on the wire.
    pub fn mark_written(&mut self, packet_id: u16) {
        if let Some(entry) = self.find_mut(packet_id) {
            entry.attempts += 1;
            if entry.state == OutboundState::Sent {
                entry.state = match entry.message.qos {
                    QoS::ExactlyOnce => OutboundState::AwaitPubrec,
                    _ => OutboundState::AwaitPuback,
                };
            }
        }
    }

    pub fn ack_outbound(&mut self, packet_id: u16, kind: AckKind) -> Result<AckResult, SessionError> {
        let index = self
            .find(packet_id)
            .ok_or(SessionError::UnknownId(packet_id))?;
        let entry = &mut self.outbound[index];
        let state = entry.state;

        match (kind, entry.message.qos, state) {
            (AckKind::PubAck, QoS::AtLeastOnce, _) => Ok(self.complete(index)),
            (AckKind::PubRec, QoS::ExactlyOnce, OutboundState::Sent | OutboundState::AwaitPubrec) => {
                entry.state = OutboundState::AwaitPubcomp;
                Ok(AckResult::AwaitingPubcomp)
            }
            // Repeated PUBREC: answer with PUBREL again
            (AckKind::PubRec, QoS::ExactlyOnce, OutboundState::AwaitPubcomp) => {
                Ok(AckResult::AwaitingPubcomp)
            }
            (AckKind::PubComp, QoS::ExactlyOnce, OutboundState::AwaitPubcomp) => {
                Ok(self.complete(index))
            }
            _ => Err(SessionError::UnexpectedAck {
                packet_id,
                kind,
                state,
            }),
        }
    }

    fn complete(&mut self, index: usize) -> AckResult {
        match self.outbound.remove(index) {
            Some(entry) => {
                self.packet_ids.release(entry.packet_id);
                AckResult::Completed(entry.message)
            }
            None => AckResult::AwaitingPubcomp,
        }
    }

    pub fn record_inbound_qos2(&mut self, packet_id: u16) -> InboundStatus {
        if self.inbound_qos2.contains_key(&packet_id) {
            debug!(target: "mqtt_client", packet_id, "Duplicate inbound QoS 2 publish");
            return InboundStatus::Duplicate;
        }
        self.inbound_qos2.insert(packet_id, InboundState::Received);
        InboundStatus::New
    }

    /// Notes that PUBREC was queued for an inbound QoS 2 message.
    pub fn mark_inbound_acknowledged(&mut self, packet_id: u16) {
        if let Some(state) = self.inbound_qos2.get_mut(&packet_id) {
            *state = InboundState::AwaitPubrel;
        }
    }

    /// Forgets an inbound QoS 2 identifier after PUBREL; false if it was unknown.
    pub fn complete_inbound_qos2(&mut self, packet_id: u16) -> bool {
        self.inbound_qos2.remove(&packet_id).is_some()
    }

    pub fn inbound_state(&self, packet_id: u16) -> Option<InboundState> {
        self.inbound_qos2.get(&packet_id).copied()
    }

    pub fn set_subscription(&mut self, filter: &str, qos: QoS) {
        self.subscriptions.insert(filter.to_string(), qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> Option<QoS> {
        self.subscriptions.remove(filter)
    }

    /// Active subscriptions ordered by filter
    pub fn subscriptions(&self) -> impl Iterator<Item = (&str, QoS)> + '_ {
        self.subscriptions.iter().map(|(filter, qos)| (filter.as_str(), *qos))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Outbound records in original send order
    pub fn outbound(&self) -> impl Iterator<Item = &InFlight> + '_ {
        self.outbound.iter()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound_qos2.len()
    }

    pub fn contains_outbound(&self, packet_id: u16) -> bool {
        self.find(packet_id).is_some()
    }

    /// True when there is state a broker-side session would have to match
    pub fn has_state(&self) -> bool {
        !self.outbound.is_empty() || !self.inbound_qos2.is_empty() || !self.subscriptions.is_empty()
    }

    /// Drops one outbound record, e.g. after a PUBREC carrying a failure code.
    pub fn remove_outbound(&mut self, packet_id: u16) -> Option<InFlight> {
        let index = self.find(packet_id)?;
        let entry = self.outbound.remove(index)?;
        self.packet_ids.release(entry.packet_id);
        Some(entry)
    }

    /// Removes every outbound record, releasing their identifiers.
    pub fn take_outbound(&mut self) -> Vec<InFlight> {
        let drained: Vec<InFlight> = self.outbound.drain(..).collect();
        for entry in &drained {
            self.packet_ids.release(entry.packet_id);
        }
        drained
    }

    /// Wipes in-flight state, subscriptions and identifier reservations.
    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound_qos2.clear();
        self.subscriptions.clear();
        self.packet_ids.clear();
    }

    fn find(&self, packet_id: u16) -> Option<usize> {
        self.outbound.iter().position(|entry| entry.packet_id == packet_id)
    }

    fn find_mut(&mut self, packet_id: u16) -> Option<&mut InFlight> {
        self.outbound.iter_mut().find(|entry| entry.packet_id == packet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, qos: QoS) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"payload"),
            qos,
            retain: false,
            properties: Properties::default(),
        }
    }

    fn store_with(qos: QoS) -> (SessionStore, u16) {
        let mut store = SessionStore::new();
        let id = store.allocate_packet_id().unwrap();
        store.record_outbound(id, message("t", qos)).unwrap();
        (store, id)
    }

    #[test]
    fn test_qos1_flow() {
        let (mut store, id) = store_with(QoS::AtLeastOnce);
        store.mark_written(id);
        assert_eq!(store.outbound().next().unwrap().state, OutboundState::AwaitPuback);

        let result = store.ack_outbound(id, AckKind::PubAck).unwrap();
        assert_eq!(result, AckResult::Completed(message("t", QoS::AtLeastOnce)));
        assert_eq!(store.outbound_len(), 0);
        assert_eq!(
            store.ack_outbound(id, AckKind::PubAck),
            Err(SessionError::UnknownId(id))
        );
    }

    #[test]
    fn test_qos2_flow() {
        let (mut store, id) = store_with(QoS::ExactlyOnce);
        store.mark_written(id);
        assert_eq!(store.outbound().next().unwrap().state, OutboundState::AwaitPubrec);

        assert_eq!(
            store.ack_outbound(id, AckKind::PubRec).unwrap(),
            AckResult::AwaitingPubcomp
        );
        assert_eq!(store.outbound().next().unwrap().state, OutboundState::AwaitPubcomp);
        // a repeated PUBREC keeps the record
        assert_eq!(
            store.ack_outbound(id, AckKind::PubRec).unwrap(),
            AckResult::AwaitingPubcomp
        );
        assert!(matches!(
            store.ack_outbound(id, AckKind::PubComp).unwrap(),
            AckResult::Completed(_)
        ));
        assert!(!store.contains_outbound(id));
    }

    #[test]
    fn test_mismatched_acks_are_rejected() {
        let (mut store, id) = store_with(QoS::ExactlyOnce);
        store.mark_written(id);
        assert!(matches!(
            store.ack_outbound(id, AckKind::PubAck),
            Err(SessionError::UnexpectedAck { .. })
        ));
        assert!(matches!(
            store.ack_outbound(id, AckKind::PubComp),
            Err(SessionError::UnexpectedAck { .. })
        ));
        assert!(store.contains_outbound(id));
    }

    #[test]
    fn test_ids_unique_while_in_flight() {
        let mut store = SessionStore::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            let id = store.allocate_packet_id().unwrap();
            assert!(seen.insert(id), "id {id} handed out twice at step {i}");
            store.record_outbound(id, message("t", QoS::AtLeastOnce)).unwrap();
        }
    }

    #[test]
    fn test_completed_ids_become_reusable() {
        let (mut store, id) = store_with(QoS::AtLeastOnce);
        store.ack_outbound(id, AckKind::PubAck).unwrap();
        store.clear();
        assert_eq!(store.allocate_packet_id().unwrap(), id);
    }

    #[test]
    fn test_record_rejects_duplicate_and_qos0() {
        let (mut store, id) = store_with(QoS::AtLeastOnce);
        assert_eq!(
            store.record_outbound(id, message("t", QoS::AtLeastOnce)),
            Err(SessionError::IdInUse(id))
        );
        assert_eq!(
            store.record_outbound(99, message("t", QoS::AtMostOnce)),
            Err(SessionError::NotTracked(99))
        );
    }

    #[test]
    fn test_send_order_preserved() {
        let mut store = SessionStore::new();
        let ids: Vec<u16> = (0..5)
            .map(|i| {
                let id = store.allocate_packet_id().unwrap();
                store
                    .record_outbound(id, message(&format!("t/{i}"), QoS::AtLeastOnce))
                    .unwrap();
                id
            })
            .collect();
        store.ack_outbound(ids[2], AckKind::PubAck).unwrap();

        let topics: Vec<&str> = store.outbound().map(|e| e.message.topic.as_str()).collect();
        assert_eq!(topics, vec!["t/0", "t/1", "t/3", "t/4"]);
    }

    #[test]
    fn test_inbound_qos2_duplicates() {
        let mut store = SessionStore::new();
        assert_eq!(store.record_inbound_qos2(5), InboundStatus::New);
        assert_eq!(store.inbound_state(5), Some(InboundState::Received));
        store.mark_inbound_acknowledged(5);
        assert_eq!(store.inbound_state(5), Some(InboundState::AwaitPubrel));
        assert_eq!(store.record_inbound_qos2(5), InboundStatus::Duplicate);

        assert!(store.complete_inbound_qos2(5));
        assert!(!store.complete_inbound_qos2(5));
        assert_eq!(store.record_inbound_qos2(5), InboundStatus::New);
    }

    #[test]
    fn test_subscriptions_and_clear() {
        let (mut store, _) = store_with(QoS::AtLeastOnce);
        store.set_subscription("b/#", QoS::AtMostOnce);
        store.set_subscription("a/b", QoS::AtLeastOnce);
        store.set_subscription("a/b", QoS::ExactlyOnce);
        store.record_inbound_qos2(3);

        let subs: Vec<(&str, QoS)> = store.subscriptions().collect();
        assert_eq!(subs, vec![("a/b", QoS::ExactlyOnce), ("b/#", QoS::AtMostOnce)]);
        assert!(store.has_state());

        store.clear();
        assert!(!store.has_state());
        assert_eq!(store.subscription_count(), 0);
        assert_eq!(store.outbound_len(), 0);
        assert_eq!(store.inbound_len(), 0);
    }

    #[test]
    fn test_take_outbound_releases_ids() {
        let (mut store, id) = store_with(QoS::ExactlyOnce);
        let taken = store.take_outbound();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].packet_id, id);
        assert_eq!(store.outbound_len(), 0);
    }

    #[test]
    fn test_release_keeps_ids_of_in_flight_messages() {
        let (mut store, id) = store_with(QoS::AtLeastOnce);
        store.release_packet_id(id);
        let next = store.allocate_packet_id().unwrap();
        assert_ne!(next, id);
    }
}
