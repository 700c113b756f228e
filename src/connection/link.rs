//! One physical connection to the broker
//!
//! A [`Link`] owns the transport, the incremental decoder and the keep-alive
//! timer for a single connection. It only exists between a successful CONNACK
//! and the moment the connection fails or is closed.

use super::keepalive::{KeepAlive, KeepAliveAction};
use super::state::{log_state_transition, ConnectionEvent, ConnectionState};
use crate::error::ClientError;
use crate::protocol::properties::{id as property_id, PropertyValue};
use crate::protocol::{describe_connack_code, Codec, ConnAck, Connect, Decoder, Packet, ProtocolError};
use crate::transport::{BrokerAddress, ConnectError, Connector, ReadStatus, TlsOptions, Transport};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Everything needed for one connection attempt.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub address: BrokerAddress,
    pub tls: Option<TlsOptions>,
    pub connect: Connect,
    /// Upper bound for inbound frames
    pub max_packet_size: usize,
    /// Bounds transport open plus the wait for CONNACK
    pub timeout: Duration,
}

pub struct Link {
    transport: Box<dyn Transport>,
    codec: Codec,
    decoder: Decoder,
    keep_alive: KeepAlive,
    state: ConnectionState,
    write_buf: BytesMut,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("version", &self.codec.version())
            .field("state", &self.state)
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}

impl Link {
    /// Opens a transport, sends CONNECT and waits for a successful CONNACK.
    ///
    /// `params.timeout` bounds the whole exchange.
    pub async fn establish(
        connector: Arc<dyn Connector>,
        params: LinkParams,
    ) -> Result<(Link, ConnAck), ClientError> {
        let deadline = Instant::now() + params.timeout;
        let timed_out = || ClientError::from(ConnectError::Timeout(params.timeout.as_millis() as u64));

        let transport = match tokio::time::timeout_at(
            deadline,
            connector.open(&params.address, params.tls.as_ref()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(timed_out()),
        };
        let codec = Codec::new(params.connect.protocol).with_max_packet_size(params.max_packet_size);
        let mut link = Link {
            transport,
            codec,
            decoder: Decoder::new(codec),
            keep_alive: KeepAlive::new(params.connect.keep_alive, Instant::now()),
            state: ConnectionState::Disconnected,
            write_buf: BytesMut::with_capacity(1024),
        };

        link.transition(ConnectionEvent::Opened);
        let connect = Packet::Connect(params.connect);
        match tokio::time::timeout_at(deadline, link.send(&connect)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(link.fail(e).await),
            Err(_) => return Err(link.fail(timed_out()).await),
        }

        let packet = match tokio::time::timeout_at(deadline, link.next_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(ClientError::ConnectionClosed)) => {
                return Err(link.fail(ConnectError::ClosedBeforeConnAck.into()).await)
            }
            Ok(Err(e)) => return Err(link.fail(e).await),
            Err(_) => return Err(link.fail(timed_out()).await),
        };

        match packet {
            Packet::ConnAck(ack) if ack.is_success() => {
                link.transition(ConnectionEvent::ConnAckAccepted);
                link.apply_server_keep_alive(&ack);
                Ok((link, ack))
            }
            Packet::ConnAck(ack) => {
                let reason = ack
                    .properties
                    .reason_string()
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        describe_connack_code(codec.version(), ack.code).to_string()
                    });
                link.transition(ConnectionEvent::ConnAckRefused(reason.clone()));
                link.transport.close().await;
                Err(ConnectError::Refused {
                    code: ack.code,
                    reason,
                }
                .into())
            }
            other => {
                let error = ProtocolError::UnexpectedPacket(other.name()).into();
                Err(link.fail(error).await)
            }
        }
    }

    fn apply_server_keep_alive(&mut self, ack: &ConnAck) {
        if let Some(PropertyValue::TwoByteInt(secs)) = ack.properties.get(property_id::SERVER_KEEP_ALIVE) {
            debug!(target: "mqtt_client", keep_alive = secs, "Broker assigned keep-alive");
            self.keep_alive = KeepAlive::new(*secs, Instant::now());
        }
    }

    fn transition(&mut self, event: ConnectionEvent) {
        if let Some(next) = self.state.next(&event) {
            log_state_transition(&self.state, &next);
            self.state = next;
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    /// Encodes and writes `packets` as one write.
    pub async fn send_all(&mut self, packets: &[Packet]) -> Result<(), ClientError> {
        if packets.is_empty() {
            return Ok(());
        }
        self.write_buf.clear();
        for packet in packets {
            trace!(target: "mqtt_client", packet = packet.name(), "Encoding packet");
            self.codec.encode(packet, &mut self.write_buf)?;
        }
        self.transport.write(&self.write_buf).await?;
        self.keep_alive.on_sent(Instant::now());
        Ok(())
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        self.send_all(std::slice::from_ref(packet)).await
    }

    /// Next complete packet already buffered, without touching the transport.
    pub fn poll_packet(&mut self) -> Result<Option<Packet>, ClientError> {
        let packet = self.decoder.decode_next()?;
        if let Some(packet) = &packet {
            let now = Instant::now();
            match packet {
                Packet::PingResp => self.keep_alive.on_pingresp(now),
                _ => self.keep_alive.on_received(now),
            }
            trace!(target: "mqtt_client", packet = packet.name(), "Decoded packet");
        }
        Ok(packet)
    }

    /// Reads more bytes into the decoder. Cancel-safe.
    pub async fn read_more(&mut self) -> Result<usize, ClientError> {
        match self.transport.read(self.decoder.buffer_mut()).await? {
            ReadStatus::Data(n) => Ok(n),
            ReadStatus::Closed => Err(ClientError::ConnectionClosed),
        }
    }

    async fn next_packet(&mut self) -> Result<Packet, ClientError> {
        loop {
            if let Some(packet) = self.poll_packet()? {
                return Ok(packet);
            }
            self.read_more().await?;
        }
    }

    /// When the keep-alive check next needs to run
    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        self.keep_alive.next_deadline()
    }

    /// Suspends or restores the PINGRESP deadline around inbound backpressure.
    pub fn set_inbound_paused(&mut self, paused: bool) {
        let now = Instant::now();
        if paused {
            self.keep_alive.pause(now);
        } else {
            self.keep_alive.resume(now);
        }
    }

    /// Sends PINGREQ when due; errors once the broker has been silent too long.
    pub async fn service_keep_alive(&mut self) -> Result<(), ClientError> {
        let now = Instant::now();
        match self.keep_alive.poll(now) {
            KeepAliveAction::Idle => Ok(()),
            KeepAliveAction::SendPing => {
                debug!(target: "mqtt_client", "Sending PINGREQ");
                self.send(&Packet::PingReq).await?;
                self.keep_alive.on_ping_sent(now);
                Ok(())
            }
            KeepAliveAction::TimedOut => {
                let grace = self.keep_alive.grace().unwrap_or_default();
                Err(ClientError::KeepAliveTimeout(grace.as_millis() as u64))
            }
        }
    }

    /// Ends the connection after a failure and returns the failure.
    pub async fn fail(mut self, error: ClientError) -> ClientError {
        self.transition(failure_event(&error));
        self.transport.close().await;
        error
    }

    /// Graceful shutdown: DISCONNECT, then close the transport.
    pub async fn disconnect(mut self, packet: Packet) {
        self.transition(ConnectionEvent::DisconnectRequested);
        let result = self.send(&packet).await;
        self.transport.close().await;
        match result {
            Ok(()) => self.transition(ConnectionEvent::Closed),
            Err(e) => self.transition(ConnectionEvent::TransportError(e.to_string())),
        }
    }
}

fn failure_event(error: &ClientError) -> ConnectionEvent {
    match error {
        ClientError::Protocol(e) => ConnectionEvent::ProtocolViolation(e.to_string()),
        ClientError::ConnectionClosed => ConnectionEvent::Closed,
        ClientError::KeepAliveTimeout(_) => ConnectionEvent::KeepAliveExpired,
        ClientError::Connect(ConnectError::Timeout(_)) => ConnectionEvent::Timeout,
        other => ConnectionEvent::TransportError(other.to_string()),
    }
}
