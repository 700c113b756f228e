//! Mock implementations for testing
//!
//! [`MockConnector`] hands the client in-memory transports whose other end is
//! a scripted [`BrokerConn`], so connection, delivery and reconnect behavior
//! can be driven packet by packet without a real broker. Everything runs on
//! `tokio::io::duplex`, which works under paused time.

use crate::client::{ClientEvent, EventSink};
use crate::protocol::{
    Ack, Codec, ConnAck, Connect, Decoder, Packet, Properties, ProtocolVersion, Publish, QoS,
    SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::transport::{BrokerAddress, ConnectError, Connector, StreamTransport, TlsOptions, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};

const DUPLEX_CAPACITY: usize = 64 * 1024;
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector whose transports lead to a [`MockBroker`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    version: ProtocolVersion,
    connections: mpsc::UnboundedSender<BrokerConn>,
    refuse: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(version: ProtocolVersion) -> (Self, MockBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            version,
            connections: tx,
            refuse: Arc::new(AtomicUsize::new(0)),
            opens: Arc::new(AtomicUsize::new(0)),
        };
        (connector, MockBroker { connections: rx })
    }

    /// Makes the next `count` opens fail as if the broker were down.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Number of transports requested so far, refused ones included
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        address: &BrokerAddress,
        _tls: Option<&TlsOptions>,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let refusal = || ConnectError::Tcp {
            addr: address.to_string(),
            detail: "connection refused".to_string(),
        };
        if refused {
            return Err(refusal());
        }

        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        self.connections
            .send(BrokerConn::new(server, self.version))
            .map_err(|_| refusal())?;
        Ok(Box::new(StreamTransport::new(client)))
    }
}

/// Accepts the connections the client opens through its [`MockConnector`].
#[derive(Debug)]
pub struct MockBroker {
    connections: mpsc::UnboundedReceiver<BrokerConn>,
}

impl MockBroker {
    /// Next connection, or None once the connector is gone
    pub async fn accept(&mut self) -> Option<BrokerConn> {
        self.connections.recv().await
    }

    /// Next connection if one is opened within `timeout`.
    pub async fn accept_within(&mut self, timeout: Duration) -> Option<BrokerConn> {
        tokio::time::timeout(timeout, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Broker side of one client connection.
#[derive(Debug)]
pub struct BrokerConn {
    stream: DuplexStream,
    codec: Codec,
    decoder: Decoder,
}

impl BrokerConn {
    fn new(stream: DuplexStream, version: ProtocolVersion) -> Self {
        let codec = Codec::new(version);
        Self {
            stream,
            codec,
            decoder: Decoder::new(codec),
        }
    }

    /// Next packet from the client; None once the client closed the stream.
    pub async fn recv(&mut self) -> Option<Packet> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(packet)) => return Some(packet),
                Ok(None) => {}
                Err(e) => panic!("client sent an undecodable packet: {e}"),
            }
            match self.stream.read_buf(self.decoder.buffer_mut()).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Next packet within `timeout`, or None.
    pub async fn recv_within(&mut self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    pub async fn expect_packet(&mut self) -> Packet {
        match tokio::time::timeout(WAIT_TIMEOUT, self.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => panic!("client closed the connection"),
            Err(_) => panic!("no packet from client within {WAIT_TIMEOUT:?}"),
        }
    }

    pub async fn expect_connect(&mut self) -> Connect {
        match self.expect_packet().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {}", other.name()),
        }
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.expect_packet().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {}", other.name()),
        }
    }

    pub async fn expect_subscribe(&mut self) -> Subscribe {
        match self.expect_packet().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {}", other.name()),
        }
    }

    pub async fn expect_unsubscribe(&mut self) -> Unsubscribe {
        match self.expect_packet().await {
            Packet::Unsubscribe(unsubscribe) => unsubscribe,
            other => panic!("expected UNSUBSCRIBE, got {}", other.name()),
        }
    }

    /// Reads the CONNECT and accepts it.
    pub async fn handshake(&mut self, session_present: bool) -> Connect {
        let connect = self.expect_connect().await;
        self.send_connack(session_present, 0).await;
        connect
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut out = BytesMut::new();
        if let Err(e) = self.codec.encode(&packet, &mut out) {
            panic!("cannot encode {}: {e}", packet.name());
        }
        // The client may already be gone; tests observe that through events
        let _ = self.stream.write_all(&out).await;
    }

    /// Writes raw bytes, for malformed-input tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes).await;
    }

    pub async fn send_connack(&mut self, session_present: bool, code: u8) {
        self.send(Packet::ConnAck(ConnAck {
            session_present,
            code,
            properties: Properties::default(),
        }))
        .await;
    }

    pub async fn send_suback(&mut self, packet_id: u16, codes: &[u8]) {
        self.send(Packet::SubAck(SubAck {
            packet_id,
            return_codes: codes.to_vec(),
            properties: Properties::default(),
        }))
        .await;
    }

    pub async fn send_unsuback(&mut self, packet_id: u16) {
        let reason_codes = if self.codec.version().is_v5() { vec![0] } else { Vec::new() };
        self.send(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties: Properties::default(),
        }))
        .await;
    }

    pub async fn send_publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) {
        self.send(Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::from_static(payload),
            properties: Properties::default(),
        }))
        .await;
    }

    pub async fn send_puback(&mut self, packet_id: u16) {
        self.send(Packet::PubAck(Ack::new(packet_id))).await;
    }

    /// Closes the stream from the broker side.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Sink that records every event and lets tests wait for specific ones.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ClientEvent>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(ClientEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }

    /// Waits until `count` events called `name` were recorded; returns the last.
    pub async fn wait_for_nth(&self, name: &str, count: usize) -> ClientEvent {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                let matching: Vec<ClientEvent> =
                    self.events().into_iter().filter(|e| e.name() == name).collect();
                if matching.len() >= count {
                    return matching[count - 1].clone();
                }
                notified.await;
            }
        };
        match tokio::time::timeout(WAIT_TIMEOUT, wait).await {
            Ok(event) => event,
            Err(_) => panic!("no '{name}' event #{count}; saw {:?}", self.names()),
        }
    }

    pub async fn wait_for(&self, name: &str) -> ClientEvent {
        self.wait_for_nth(name, 1).await
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: ClientEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        self.notify.notify_waiters();
    }
}
