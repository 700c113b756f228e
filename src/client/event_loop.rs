//! The client's single owner task
//!
//! One `EventLoop` per client owns the session, the delivery manager, the
//! reconnect supervisor and at most one live [`Link`]. Handles talk to it
//! through a command channel; it talks back through oneshot replies and the
//! event outbox. Nothing here is shared, so nothing here locks.
//!
//! Inbound backpressure: decoded packets only become events while fewer than
//! `INBOUND_BATCH` events are waiting for the outbox. Past that the loop stops
//! decoding and stops reading from the transport until the embedder catches up.

use super::command::{Command, PendingRequest, Queued, Reply};
use super::events::ClientEvent;
use super::ClientState;
use crate::config::ClientConfig;
use crate::connection::{ConnectionState, Link, LinkParams};
use crate::delivery::DeliveryManager;
use crate::error::{ClientError, ClientResult};
use crate::observability::metrics::ClientMetrics;
use crate::protocol::{
    ConnAck, Disconnect, Packet, Properties, ProtocolError, QoS, SubAck, Subscribe,
    SubscribeFilter, SubscriptionOptions, UnsubAck, Unsubscribe,
};
use crate::reconnect::{ReconnectDecision, Supervisor};
use crate::session::OutboundMessage;
use crate::transport::Connector;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn, Instrument};

/// Events that may wait for the outbox before reading stops
const INBOUND_BATCH: usize = 32;

/// Intents accepted while disconnected
const MAX_OFFLINE_QUEUE: usize = 10_000;

type Handshake = Pin<Box<dyn Future<Output = Result<(Link, ConnAck), ClientError>> + Send>>;

enum Phase {
    Idle,
    Connecting(Handshake),
    Connected(Link),
    Backoff(Pin<Box<Sleep>>),
    GivenUp,
}

enum PhaseEvent {
    Handshake(Result<(Link, ConnAck), ClientError>),
    Read(Result<usize, ClientError>),
    KeepAliveDue,
    BackoffElapsed,
}

enum LoopEvent {
    Command(Command),
    HandlesDropped,
    OutboxReady,
    OutboxClosed,
    Phase(PhaseEvent),
}

pub(crate) struct EventLoop {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    delivery: DeliveryManager,
    supervisor: Supervisor,
    metrics: Arc<ClientMetrics>,
    commands: mpsc::Receiver<Command>,
    outbox: mpsc::Sender<ClientEvent>,
    outbox_closed: bool,
    state_tx: watch::Sender<ClientState>,
    phase: Phase,
    connection: ConnectionState,
    /// The embedder wants a connection (connect() without a later disconnect())
    wanted: bool,
    connect_waiters: Vec<Reply<()>>,
    queued: VecDeque<Queued>,
    /// SUBSCRIBE/UNSUBSCRIBE awaiting acknowledgement, in send order
    pending_requests: Vec<(u16, PendingRequest)>,
    pending_events: VecDeque<ClientEvent>,
}

impl EventLoop {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<ClientMetrics>,
        commands: mpsc::Receiver<Command>,
        outbox: mpsc::Sender<ClientEvent>,
        state_tx: watch::Sender<ClientState>,
    ) -> Self {
        Self {
            delivery: DeliveryManager::new(config.protocol, Arc::clone(&metrics)),
            supervisor: Supervisor::new(config.reconnect.clone()),
            config,
            connector,
            metrics,
            commands,
            outbox,
            outbox_closed: false,
            state_tx,
            phase: Phase::Idle,
            connection: ConnectionState::Disconnected,
            wanted: false,
            connect_waiters: Vec::new(),
            queued: VecDeque::new(),
            pending_requests: Vec::new(),
            pending_events: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            client_id = %self.config.client_id,
            broker = %self.config.broker_url,
            retry_budget_ms = ?self.config.reconnect.calculate_max_total_time(),
            "MQTT client started"
        );

        loop {
            let inbound_open = self.pending_events.len() < INBOUND_BATCH;
            let has_pending = !self.pending_events.is_empty();
            if let Phase::Connected(link) = &mut self.phase {
                link.set_inbound_paused(!inbound_open);
            }

            let event = tokio::select! {
                biased;
                ready = self.outbox.reserve(), if has_pending => match ready {
                    Ok(_permit) => LoopEvent::OutboxReady,
                    Err(_) => LoopEvent::OutboxClosed,
                },
                command = self.commands.recv() => match command {
                    Some(command) => LoopEvent::Command(command),
                    None => LoopEvent::HandlesDropped,
                },
                phase = next_phase_event(&mut self.phase, inbound_open) => LoopEvent::Phase(phase),
            };

            match event {
                LoopEvent::OutboxReady => self.flush_events(),
                LoopEvent::OutboxClosed => {
                    warn!("Event consumer is gone; dropping further events");
                    self.outbox_closed = true;
                    self.pending_events.clear();
                }
                LoopEvent::Command(command) => {
                    debug!(target: "mqtt_client", command = command.name(), "Handling command");
                    self.handle_command(command).await;
                }
                LoopEvent::HandlesDropped => {
                    self.shutdown().await;
                    self.publish_state();
                    break;
                }
                LoopEvent::Phase(event) => self.handle_phase_event(event).await,
            }

            // Packets left in the decoder once the outbox had room again
            if self.pending_events.len() < INBOUND_BATCH {
                self.drain_buffered().await;
            }
            self.publish_state();
        }

        info!(client_id = %self.config.client_id, "MQTT client stopped");
    }

    fn publish_state(&self) {
        let next = ClientState {
            supervisor: self.supervisor.state(),
            connection: self.connection.clone(),
        };
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn emit(&mut self, event: ClientEvent) {
        if self.outbox_closed {
            return;
        }
        debug!(target: "mqtt_client", event = event.name(), "Emitting event");
        self.pending_events.push_back(event);
        self.flush_events();
    }

    fn emit_error(&mut self, error: &ClientError) {
        self.emit(ClientEvent::Error {
            kind: error.kind(),
            detail: error.sanitized(),
        });
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.pending_events.pop_front() {
            match self.outbox.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.pending_events.push_front(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.outbox_closed = true;
                    self.pending_events.clear();
                    break;
                }
            }
        }
    }

    fn take_link(&mut self) -> Option<Link> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connected(link) => Some(link),
            other => {
                self.phase = other;
                None
            }
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected(_))
    }

    /// Puts the link back, or tears it down when `result` is a failure.
    async fn restore_or_fail(&mut self, link: Link, result: ClientResult<()>) {
        match result {
            Ok(()) => self.phase = Phase::Connected(link),
            Err(error) => self.connection_lost(link, error).await,
        }
    }

    async fn handle_phase_event(&mut self, event: PhaseEvent) {
        match event {
            PhaseEvent::Handshake(result) => self.on_handshake(result).await,
            PhaseEvent::Read(result) => {
                let Some(mut link) = self.take_link() else {
                    return;
                };
                let result = match result {
                    Ok(_) => self.process_inbound(&mut link).await,
                    Err(error) => Err(error),
                };
                self.restore_or_fail(link, result).await;
            }
            PhaseEvent::KeepAliveDue => {
                let Some(mut link) = self.take_link() else {
                    return;
                };
                let was_outstanding = link.keep_alive().ping_outstanding();
                let result = link.service_keep_alive().await;
                if result.is_ok() && !was_outstanding && link.keep_alive().ping_outstanding() {
                    self.metrics.ping_sent();
                }
                self.restore_or_fail(link, result).await;
            }
            PhaseEvent::BackoffElapsed => {
                self.phase = Phase::Idle;
                self.start_attempt();
            }
        }
    }

    async fn drain_buffered(&mut self) {
        let Some(mut link) = self.take_link() else {
            return;
        };
        let result = self.process_inbound(&mut link).await;
        self.restore_or_fail(link, result).await;
    }

    async fn process_inbound(&mut self, link: &mut Link) -> ClientResult<()> {
        while self.pending_events.len() < INBOUND_BATCH {
            let Some(packet) = link.poll_packet()? else {
                break;
            };
            self.handle_packet(link, packet).await?;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, link: &mut Link, packet: Packet) -> ClientResult<()> {
        match packet {
            Packet::Publish(publish) => {
                let outcome = self.delivery.on_publish(publish);
                if let Some(message) = outcome.deliver {
                    self.emit(ClientEvent::Message {
                        topic: message.topic,
                        payload: message.payload,
                        qos: message.qos,
                        retain: message.retain,
                    });
                }
                if let Some(reply) = outcome.reply {
                    link.send(&reply).await?;
                }
            }
            Packet::PubAck(ack) => self.delivery.on_puback(&ack),
            Packet::PubRec(ack) => {
                if let Some(pubrel) = self.delivery.on_pubrec(&ack) {
                    link.send(&pubrel).await?;
                }
            }
            Packet::PubRel(ack) => {
                let pubcomp = self.delivery.on_pubrel(&ack);
                link.send(&pubcomp).await?;
            }
            Packet::PubComp(ack) => self.delivery.on_pubcomp(&ack),
            Packet::SubAck(ack) => self.on_suback(ack),
            Packet::UnsubAck(ack) => self.on_unsuback(ack),
            Packet::PingResp => {}
            Packet::Disconnect(disconnect) => {
                warn!(
                    code = disconnect.reason_code,
                    reason = disconnect.properties.reason_string().unwrap_or_default(),
                    "Broker sent DISCONNECT"
                );
                return Err(ClientError::ConnectionClosed);
            }
            other => return Err(ProtocolError::UnexpectedPacket(other.name()).into()),
        }
        Ok(())
    }

    fn take_pending(&mut self, packet_id: u16) -> Option<PendingRequest> {
        let index = self
            .pending_requests
            .iter()
            .position(|(id, _)| *id == packet_id)?;
        let (_, request) = self.pending_requests.remove(index);
        self.delivery.store_mut().release_packet_id(packet_id);
        Some(request)
    }

    fn on_suback(&mut self, ack: SubAck) {
        let Some(request) = self.take_pending(ack.packet_id) else {
            warn!(packet_id = ack.packet_id, "SUBACK for unknown packet id");
            return;
        };
        let (filter, requested, reply) = match request {
            PendingRequest::Subscribe { filter, qos, reply } => (filter, qos, reply),
            other => {
                warn!(packet_id = ack.packet_id, "SUBACK answered an UNSUBSCRIBE");
                reject_reply(&mut other.requeue(), &ProtocolError::UnexpectedPacket("SUBACK").into());
                return;
            }
        };

        let code = ack.return_codes.first().copied().unwrap_or(0x80);
        match QoS::try_from(code) {
            Ok(granted) => {
                info!(filter = %filter, requested = ?requested, granted = ?granted, "Subscribed");
                self.delivery.store_mut().set_subscription(&filter, granted);
                self.emit(ClientEvent::Subscribed {
                    filter,
                    granted_qos: granted,
                });
                respond(reply, Ok(granted));
            }
            Err(_) => {
                warn!(filter = %filter, code, "Broker rejected subscription");
                respond(
                    reply,
                    Err(ClientError::Rejected {
                        operation: "subscribe",
                        filter,
                        code,
                    }),
                );
            }
        }
    }

    fn on_unsuback(&mut self, ack: UnsubAck) {
        let Some(request) = self.take_pending(ack.packet_id) else {
            warn!(packet_id = ack.packet_id, "UNSUBACK for unknown packet id");
            return;
        };
        let (filter, reply) = match request {
            PendingRequest::Unsubscribe { filter, reply } => (filter, reply),
            other => {
                warn!(packet_id = ack.packet_id, "UNSUBACK answered a SUBSCRIBE");
                reject_reply(&mut other.requeue(), &ProtocolError::UnexpectedPacket("UNSUBACK").into());
                return;
            }
        };

        match ack.reason_codes.first().copied() {
            Some(code) if code >= 0x80 => {
                warn!(filter = %filter, code, "Broker rejected unsubscribe");
                respond(
                    reply,
                    Err(ClientError::Rejected {
                        operation: "unsubscribe",
                        filter,
                        code,
                    }),
                );
            }
            _ => {
                info!(filter = %filter, "Unsubscribed");
                self.delivery.store_mut().remove_subscription(&filter);
                self.emit(ClientEvent::Unsubscribed { filter });
                respond(reply, Ok(()));
            }
        }
    }

    fn link_params(&self) -> ClientResult<LinkParams> {
        Ok(LinkParams {
            address: self.config.broker_address()?,
            tls: self.config.tls_options(),
            connect: self.config.connect_packet()?,
            max_packet_size: self.config.max_packet_size,
            timeout: self.config.connect_timeout(),
        })
    }

    fn start_attempt(&mut self) {
        let params = match self.link_params() {
            Ok(params) => params,
            Err(error) => {
                // Configuration problems do not get better by retrying
                warn!(error = %error, "Cannot start connection attempt");
                self.wanted = false;
                self.supervisor.stop();
                self.phase = Phase::Idle;
                for waiter in self.connect_waiters.drain(..) {
                    respond(Some(waiter), Err(error.clone()));
                }
                self.emit_error(&error);
                return;
            }
        };

        self.metrics.connection_attempt();
        self.connection = ConnectionState::Connecting;
        let span = crate::connection_span!(
            client_id = %params.connect.client_id,
            broker = %params.address,
            attempt = self.supervisor.attempts()
        );
        info!(broker = %params.address, "Connecting to broker");
        let handshake = Link::establish(Arc::clone(&self.connector), params).instrument(span);
        self.phase = Phase::Connecting(Box::pin(handshake));
    }

    async fn on_handshake(&mut self, result: Result<(Link, ConnAck), ClientError>) {
        self.phase = Phase::Idle;
        match result {
            Ok((mut link, ack)) => {
                let result = self.on_connected(&mut link, ack).await;
                self.restore_or_fail(link, result).await;
            }
            Err(error) => self.attempt_failed(error),
        }
    }

    async fn on_connected(&mut self, link: &mut Link, ack: ConnAck) -> ClientResult<()> {
        self.metrics.connection_established();
        self.supervisor.on_connected();
        self.connection = ConnectionState::Connected;

        let resumed = ack.session_present && !self.config.clean_start;
        let mut resubscribe = Vec::new();
        if !resumed && self.delivery.store().has_state() {
            if self.config.resubscribe_on_session_loss {
                resubscribe = self
                    .delivery
                    .store()
                    .subscriptions()
                    .map(|(filter, qos)| (filter.to_string(), qos))
                    .collect();
            }
            warn!(
                in_flight = self.delivery.store().outbound_len(),
                subscriptions = self.delivery.store().subscription_count(),
                "Broker did not resume the session; discarding session state"
            );
            self.delivery.reset_session(ClientError::SessionLost);
            if !self.config.clean_start {
                self.emit_error(&ClientError::SessionLost);
            }
        }

        self.emit(ClientEvent::Connected {
            session_present: ack.session_present,
        });
        for waiter in self.connect_waiters.drain(..) {
            respond(Some(waiter), Ok(()));
        }

        // Resubscriptions, then unfinished flows in send order, then queued intents
        let mut packets = Vec::new();
        for (filter, qos) in resubscribe {
            packets.extend(self.subscribe_packet(filter, qos, None));
        }
        let resumed_flows = self.delivery.resume();
        if !resumed_flows.is_empty() {
            info!(count = resumed_flows.len(), "Resuming in-flight messages");
        }
        packets.extend(resumed_flows);
        while let Some(item) = self.queued.pop_front() {
            packets.extend(self.prepare(item));
        }
        self.write_packets(link, packets).await
    }

    fn attempt_failed(&mut self, error: ClientError) {
        warn!(error = %error, "Connection attempt failed");
        self.metrics.connection_failed();
        self.connection = ConnectionState::Failed(error.sanitized());
        for waiter in self.connect_waiters.drain(..) {
            respond(Some(waiter), Err(error.clone()));
        }
        self.emit_error(&error);
        self.schedule_reconnect();
    }

    async fn connection_lost(&mut self, link: Link, error: ClientError) {
        let error = link.fail(error).await;
        self.metrics.connection_failed();
        self.connection = ConnectionState::Failed(error.sanitized());
        self.requeue_pending();
        self.emit(ClientEvent::Disconnected {
            reason: error.sanitized(),
        });
        self.emit_error(&error);
        self.phase = Phase::Idle;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.supervisor.on_failure(!self.wanted) {
            ReconnectDecision::Proceed { attempt, delay_ms } => {
                self.metrics.reconnect_scheduled();
                self.emit(ClientEvent::Reconnecting { attempt, delay_ms });
                let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
                self.phase = Phase::Backoff(Box::pin(sleep));
            }
            ReconnectDecision::AbortShutdownRequested => {
                self.phase = Phase::Idle;
            }
            ReconnectDecision::AbortMaxAttemptsExceeded => {
                let error = ClientError::GivenUp(self.supervisor.attempts());
                self.wanted = false;
                self.delivery.fail_waiters(error.clone());
                for item in self.queued.iter_mut() {
                    reject_reply(item, &error);
                }
                for waiter in self.connect_waiters.drain(..) {
                    respond(Some(waiter), Err(error.clone()));
                }
                self.emit_error(&error);
                self.phase = Phase::GivenUp;
            }
        }
    }

    /// Unanswered SUBSCRIBE/UNSUBSCRIBE go back to the front of the queue.
    fn requeue_pending(&mut self) {
        let pending: Vec<(u16, PendingRequest)> = self.pending_requests.drain(..).collect();
        for (packet_id, request) in pending.into_iter().rev() {
            self.delivery.store_mut().release_packet_id(packet_id);
            self.queued.push_front(request.requeue());
        }
    }

    fn subscribe_packet(&mut self, filter: String, qos: QoS, reply: Option<Reply<QoS>>) -> Option<Packet> {
        let packet_id = match self.delivery.store_mut().allocate_packet_id() {
            Ok(id) => id,
            Err(error) => {
                respond(reply, Err(error.into()));
                return None;
            }
        };
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![SubscribeFilter {
                filter: filter.clone(),
                options: SubscriptionOptions::with_qos(qos),
            }],
            properties: Properties::default(),
        });
        self.pending_requests
            .push((packet_id, PendingRequest::Subscribe { filter, qos, reply }));
        Some(packet)
    }

    fn unsubscribe_packet(&mut self, filter: String, reply: Option<Reply<()>>) -> Option<Packet> {
        let packet_id = match self.delivery.store_mut().allocate_packet_id() {
            Ok(id) => id,
            Err(error) => {
                respond(reply, Err(error.into()));
                return None;
            }
        };
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec![filter.clone()],
            properties: Properties::default(),
        });
        self.pending_requests
            .push((packet_id, PendingRequest::Unsubscribe { filter, reply }));
        Some(packet)
    }

    fn prepare(&mut self, item: Queued) -> Option<Packet> {
        match item {
            Queued::Publish { message, reply } => self.delivery.begin_publish(message, reply),
            Queued::Subscribe { filter, qos, reply } => self.subscribe_packet(filter, qos, reply),
            Queued::Unsubscribe { filter, reply } => self.unsubscribe_packet(filter, reply),
        }
    }

    async fn write_packets(&mut self, link: &mut Link, packets: Vec<Packet>) -> ClientResult<()> {
        if packets.is_empty() {
            return Ok(());
        }
        link.send_all(&packets).await?;
        for packet in &packets {
            self.delivery.on_written(packet);
        }
        Ok(())
    }

    /// Sends `item` now when connected, otherwise queues it.
    async fn send_or_queue(&mut self, item: Queued) {
        if !self.is_connected() {
            self.enqueue(item);
            return;
        }
        let Some(packet) = self.prepare(item) else {
            return;
        };
        let Some(mut link) = self.take_link() else {
            return;
        };
        let result = self.write_packets(&mut link, vec![packet]).await;
        self.restore_or_fail(link, result).await;
    }

    fn enqueue(&mut self, mut item: Queued) {
        if self.queued.len() >= MAX_OFFLINE_QUEUE {
            warn!(queued = self.queued.len(), "Offline queue is full");
            reject_reply(&mut item, &ClientError::InvalidState("offline queue is full".to_string()));
            return;
        }
        debug!(target: "mqtt_client", queued = self.queued.len() + 1, "Queued until connected");
        self.queued.push_back(item);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Disconnect { reply } => {
                self.disconnect().await;
                respond(Some(reply), Ok(()));
            }
            Command::Publish { message, reply } => self.publish(message, reply).await,
            Command::Subscribe { filter, qos, reply } => {
                self.send_or_queue(Queued::Subscribe {
                    filter,
                    qos,
                    reply: Some(reply),
                })
                .await;
            }
            Command::Unsubscribe { filter, reply } => {
                self.send_or_queue(Queued::Unsubscribe {
                    filter,
                    reply: Some(reply),
                })
                .await;
            }
            Command::Subscriptions { reply } => {
                let subscriptions = self
                    .delivery
                    .store()
                    .subscriptions()
                    .map(|(filter, qos)| (filter.to_string(), qos))
                    .collect();
                let _ = reply.send(subscriptions);
            }
            Command::InFlight { reply } => {
                let _ = reply.send(self.delivery.in_flight());
            }
            Command::AbandonInFlight { reply } => {
                let _ = reply.send(self.abandon_in_flight());
            }
            Command::Reconfigure { config, reply } => self.reconfigure(*config, reply).await,
        }
    }

    fn connect(&mut self, reply: Reply<()>) {
        match self.phase {
            Phase::Connected(_) => respond(Some(reply), Ok(())),
            Phase::Connecting(_) | Phase::Backoff(_) => self.connect_waiters.push(reply),
            Phase::Idle | Phase::GivenUp => {
                self.wanted = true;
                self.supervisor.start();
                self.connect_waiters.push(reply);
                self.start_attempt();
            }
        }
    }

    async fn disconnect(&mut self) {
        self.wanted = false;
        self.supervisor.stop();

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connected(link) => {
                info!("Disconnecting from broker");
                self.requeue_pending();
                link.disconnect(Packet::Disconnect(Disconnect::default())).await;
                self.metrics.connection_lost();
                self.emit(ClientEvent::Disconnected {
                    reason: "client disconnected".to_string(),
                });
            }
            Phase::Connecting(handshake) => {
                // Dropping the handshake closes its transport
                drop(handshake);
                info!("Cancelled connection attempt");
            }
            Phase::Backoff(_) => info!("Cancelled scheduled reconnect"),
            Phase::Idle | Phase::GivenUp => {}
        }
        self.connection = ConnectionState::Disconnected;
        for waiter in self.connect_waiters.drain(..) {
            respond(Some(waiter), Err(ClientError::NotConnected));
        }
    }

    async fn publish(&mut self, message: OutboundMessage, reply: Reply<()>) {
        if !self.is_connected() && message.qos == QoS::AtMostOnce {
            debug!(target: "mqtt_client", topic = %message.topic, "Dropping QoS 0 publish while disconnected");
            respond(Some(reply), Err(ClientError::NotConnected));
            return;
        }
        self.send_or_queue(Queued::Publish {
            message,
            reply: Some(reply),
        })
        .await;
    }

    fn abandon_in_flight(&mut self) -> usize {
        let mut dropped = self.delivery.abandon();
        let queued: Vec<Queued> = self.queued.drain(..).collect();
        for mut item in queued {
            if matches!(item, Queued::Publish { .. }) {
                reject_reply(&mut item, &ClientError::Abandoned);
                dropped += 1;
            } else {
                self.queued.push_back(item);
            }
        }
        info!(dropped, "Abandoned in-flight messages");
        dropped
    }

    async fn reconfigure(&mut self, config: ClientConfig, reply: Reply<()>) {
        let identity_changed =
            config.client_id != self.config.client_id || config.broker_url != self.config.broker_url;
        self.disconnect().await;
        if identity_changed {
            info!(client_id = %config.client_id, broker = %config.broker_url, "Client identity changed; starting a new session");
            self.delivery.reset_session(ClientError::SessionLost);
        }
        self.delivery.set_version(config.protocol);
        self.supervisor.set_config(config.reconnect.clone());
        self.config = config;
        self.connect(reply);
    }

    async fn shutdown(&mut self) {
        info!("All client handles dropped; shutting down");
        self.disconnect().await;
        self.delivery.fail_waiters(ClientError::Shutdown);
        for mut item in self.queued.drain(..) {
            reject_reply(&mut item, &ClientError::Shutdown);
        }
        for (_, request) in self.pending_requests.drain(..) {
            let mut item = request.requeue();
            reject_reply(&mut item, &ClientError::Shutdown);
        }
        self.flush_events();
    }
}

async fn next_phase_event(phase: &mut Phase, inbound_open: bool) -> PhaseEvent {
    match phase {
        Phase::Connecting(handshake) if inbound_open => PhaseEvent::Handshake(handshake.as_mut().await),
        Phase::Connected(link) => {
            let deadline = link.keep_alive_deadline();
            tokio::select! {
                result = link.read_more(), if inbound_open => PhaseEvent::Read(result),
                _ = sleep_until(deadline) => PhaseEvent::KeepAliveDue,
            }
        }
        Phase::Backoff(sleep) if inbound_open => {
            sleep.as_mut().await;
            PhaseEvent::BackoffElapsed
        }
        _ => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn respond<T>(reply: Option<Reply<T>>, result: ClientResult<T>) {
    if let Some(reply) = reply {
        // The caller may have stopped waiting
        let _ = reply.send(result);
    }
}

fn reject_reply(item: &mut Queued, error: &ClientError) {
    match item {
        Queued::Publish { reply, .. } | Queued::Unsubscribe { reply, .. } => {
            respond(reply.take(), Err(error.clone()));
        }
        Queued::Subscribe { reply, .. } => respond(reply.take(), Err(error.clone())),
    }
}
