//! Client facade
//!
//! A [`Client`] is a cheap, cloneable handle. All work happens in one spawned
//! event loop task per client; handles send it commands and await replies.
//! Dropping the last handle disconnects gracefully and stops the task.
//!
//! ```no_run
//! use mqtt_client_engine::{Client, ClientConfig, QoS};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (client, mut events) = Client::channel(ClientConfig::new("mqtt://localhost:1883"))?;
//! client.connect().await?;
//! client.subscribe("sensors/+/temp", QoS::AtLeastOnce).await?;
//! client.publish("sensors/kitchen/temp", "21.5", QoS::AtLeastOnce, false).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}: {}", event.name(), event.payload());
//! }
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod event_loop;
pub mod events;

pub use events::{CallbackSink, ChannelSink, ClientEvent, EventSink};

use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::delivery::InFlightSummary;
use crate::error::{ApplicationError, ClientError, ClientResult};
use crate::observability::metrics::{ClientMetrics, MetricsSnapshot};
use crate::protocol::{validate_topic_filter, validate_topic_name, QoS, MAX_REMAINING_LENGTH};
use crate::reconnect::SupervisorState;
use crate::session::OutboundMessage;
use crate::transport::{Connector, TcpConnector};
use bytes::Bytes;
use command::Command;
use event_loop::EventLoop;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

const COMMAND_BUFFER: usize = 128;

/// Snapshot of the client as seen by the embedder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientState {
    pub supervisor: SupervisorState,
    pub connection: ConnectionState,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            supervisor: SupervisorState::Idle,
            connection: ConnectionState::Disconnected,
        }
    }
}

impl ClientState {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ClientState>,
    metrics: Arc<ClientMetrics>,
    max_packet_size: Arc<AtomicUsize>,
}

impl Client {
    /// Creates a client that reaches the broker over TCP or TLS.
    ///
    /// Must be called from within a tokio runtime. Nothing touches the network
    /// until [`connect`](Self::connect).
    pub fn new(config: ClientConfig, sink: Arc<dyn EventSink>) -> ClientResult<Self> {
        Self::with_connector(config, sink, Arc::new(TcpConnector::new()))
    }

    /// Like [`new`](Self::new), with events delivered into a bounded channel.
    pub fn channel(config: ClientConfig) -> ClientResult<(Self, mpsc::Receiver<ClientEvent>)> {
        let (sink, receiver) = ChannelSink::channel(config.event_buffer);
        let client = Self::new(config, Arc::new(sink))?;
        Ok((client, receiver))
    }

    /// Creates a client over a caller-supplied transport.
    pub fn with_connector(
        config: ClientConfig,
        sink: Arc<dyn EventSink>,
        connector: Arc<dyn Connector>,
    ) -> ClientResult<Self> {
        config.validate()?;

        let metrics = Arc::new(ClientMetrics::new());
        let max_packet_size = Arc::new(AtomicUsize::new(config.max_packet_size));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ClientState::default());
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<ClientEvent>(config.event_buffer.max(1));

        let event_loop = EventLoop::new(
            config,
            connector,
            Arc::clone(&metrics),
            command_rx,
            outbox_tx,
            state_tx,
        );
        tokio::spawn(event_loop.run());

        // Forwarder: a slow sink fills the outbox, which pauses inbound reads
        tokio::spawn(async move {
            while let Some(event) = outbox_rx.recv().await {
                sink.emit(event).await;
            }
            debug!(target: "mqtt_client", "Event forwarder finished");
        });

        Ok(Self {
            commands: command_tx,
            state: state_rx,
            metrics,
            max_packet_size,
        })
    }

    /// Connects and waits for the first CONNACK.
    ///
    /// A failed first attempt is reported here and retried in the background
    /// according to the reconnect policy, unless `disconnect` is called.
    pub async fn connect(&self) -> ClientResult<()> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Sends DISCONNECT and closes the transport. Suppresses reconnects.
    ///
    /// Unacknowledged QoS 1/2 publishes stay pending and resume on the next
    /// `connect`.
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Publishes a message.
    ///
    /// QoS 0 resolves once written. QoS 1 resolves on PUBACK, QoS 2 on PUBCOMP.
    /// While disconnected, QoS 1/2 publishes are queued and QoS 0 fails with
    /// [`ClientError::NotConnected`].
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<()> {
        let message = OutboundMessage::new(topic, payload, qos, retain);
        self.publish_message(message).await
    }

    /// Publishes a prepared message, including any MQTT 5 properties.
    pub async fn publish_message(&self, message: OutboundMessage) -> ClientResult<()> {
        validate_topic_name(&message.topic).map_err(ApplicationError::InvalidTopicName)?;
        self.check_size(&message)?;
        self.request(|reply| Command::Publish { message, reply }).await?
    }

    /// Subscribes to `filter`; resolves with the QoS the broker granted.
    pub async fn subscribe(&self, filter: impl Into<String>, qos: QoS) -> ClientResult<QoS> {
        let filter = filter.into();
        validate_topic_filter(&filter).map_err(ApplicationError::InvalidTopicFilter)?;
        self.request(|reply| Command::Subscribe { filter, qos, reply }).await?
    }

    pub async fn unsubscribe(&self, filter: impl Into<String>) -> ClientResult<()> {
        let filter = filter.into();
        validate_topic_filter(&filter).map_err(ApplicationError::InvalidTopicFilter)?;
        self.request(|reply| Command::Unsubscribe { filter, reply }).await?
    }

    /// Disconnects, applies `config` and connects again.
    ///
    /// Changing the client id or broker URL starts a fresh session.
    pub async fn reconnect_with(&self, config: ClientConfig) -> ClientResult<()> {
        config.validate()?;
        let max_packet_size = config.max_packet_size;
        let config = Box::new(config);
        let result = self
            .request(|reply| Command::Reconfigure { config, reply })
            .await?;
        self.max_packet_size.store(max_packet_size, Ordering::Relaxed);
        result
    }

    /// Subscriptions the broker has acknowledged, in filter order.
    pub async fn subscriptions(&self) -> ClientResult<Vec<(String, QoS)>> {
        self.request(|reply| Command::Subscriptions { reply }).await
    }

    /// Outbound messages awaiting acknowledgement, oldest first.
    pub async fn in_flight(&self) -> ClientResult<Vec<InFlightSummary>> {
        self.request(|reply| Command::InFlight { reply }).await
    }

    /// Drops every unacknowledged and queued publish; returns how many.
    pub async fn abandon_in_flight(&self) -> ClientResult<usize> {
        self.request(|reply| Command::AbandonInFlight { reply }).await
    }

    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn check_size(&self, message: &OutboundMessage) -> ClientResult<()> {
        let max = self
            .max_packet_size
            .load(Ordering::Relaxed)
            .min(MAX_REMAINING_LENGTH);
        let packet_id = if message.qos == QoS::AtMostOnce { 0 } else { 2 };
        let size = 2 + message.topic.len() + packet_id + message.payload.len();
        if size > max {
            return Err(ApplicationError::PayloadTooLarge {
                size: message.payload.len(),
                max,
            }
            .into());
        }
        Ok(())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> ClientResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ClientError::Shutdown)?;
        response.await.map_err(|_| ClientError::Shutdown)
    }
}
