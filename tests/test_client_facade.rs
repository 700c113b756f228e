//! Client facade behavior: argument validation, subscriptions, state,
//! event delivery and shutdown.


use async_trait::async_trait;
use client_harness::{start, start_default, test_config};
use mqtt_client_engine::protocol::{Disconnect, Packet};
use mqtt_client_engine::testing::{MockConnector, RecordingSink};
use mqtt_client_engine::{
    ApplicationError, CallbackSink, Client, ClientError, ClientEvent, EventSink, ProtocolVersion, QoS,
    SupervisorState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_invalid_arguments_fail_without_network() {
    let h = start_default();

    let publish = h.client.publish("a/+/c", "x", QoS::AtLeastOnce, false).await;
    assert!(matches!(
        publish,
        Err(ClientError::Application(ApplicationError::InvalidTopicName(_)))
    ));

    let subscribe = h.client.subscribe("a/#/c", QoS::AtMostOnce).await;
    assert!(matches!(
        subscribe,
        Err(ClientError::Application(ApplicationError::InvalidTopicFilter(_)))
    ));

    let unsubscribe = h.client.unsubscribe("").await;
    assert!(matches!(
        unsubscribe,
        Err(ClientError::Application(ApplicationError::InvalidTopicFilter(_)))
    ));

    assert_eq!(h.connector.open_count(), 0);
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let mut config = test_config();
    config.max_packet_size = 64;
    let h = start(config);

    let result = h
        .client
        .publish("big", vec![0u8; 100], QoS::AtLeastOnce, false)
        .await;

    assert!(matches!(
        result,
        Err(ClientError::Application(ApplicationError::PayloadTooLarge { size: 100, max: 64 }))
    ));
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_construction() {
    let (connector, _broker) = MockConnector::new(ProtocolVersion::V311);
    let mut config = test_config();
    config.broker_url = "http://not-mqtt".to_string();

    let result = Client::with_connector(config, RecordingSink::new(), Arc::new(connector));

    assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_qos0_publish_while_disconnected_fails() {
    let h = start_default();
    let result = h.client.publish("t", "x", QoS::AtMostOnce, false).await;
    assert!(matches!(result, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn test_subscribe_and_unsubscribe_round_trip() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    let (granted, ()) = tokio::join!(h.client.subscribe("sensors/+/temp", QoS::ExactlyOnce), async {
        let subscribe = conn.expect_subscribe().await;
        assert_eq!(subscribe.filters[0].options.qos, QoS::ExactlyOnce);
        // Broker downgrades
        conn.send_suback(subscribe.packet_id, &[1]).await;
    });
    assert_eq!(granted.unwrap(), QoS::AtLeastOnce);
    // The session remembers what the broker granted, not what was asked for
    assert_eq!(
        h.client.subscriptions().await.unwrap(),
        vec![("sensors/+/temp".to_string(), QoS::AtLeastOnce)]
    );

    let (result, ()) = tokio::join!(h.client.unsubscribe("sensors/+/temp"), async {
        let unsubscribe = conn.expect_unsubscribe().await;
        assert_eq!(unsubscribe.filters, vec!["sensors/+/temp".to_string()]);
        conn.send_unsuback(unsubscribe.packet_id).await;
    });
    result.unwrap();
    assert!(h.client.subscriptions().await.unwrap().is_empty());

    h.sink.wait_for("unsubscribed").await;
    let subscribed = h.sink.wait_for("subscribed").await;
    assert_eq!(
        subscribed,
        ClientEvent::Subscribed {
            filter: "sensors/+/temp".to_string(),
            granted_qos: QoS::AtLeastOnce,
        }
    );
}

#[tokio::test]
async fn test_rejected_subscription_is_not_remembered() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    let (result, ()) = tokio::join!(h.client.subscribe("forbidden/#", QoS::AtLeastOnce), async {
        let subscribe = conn.expect_subscribe().await;
        conn.send_suback(subscribe.packet_id, &[0x80]).await;
    });

    assert!(matches!(
        result,
        Err(ClientError::Rejected {
            operation: "subscribe",
            code: 0x80,
            ..
        })
    ));
    assert!(h.client.subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_subscribe_before_connect_is_sent_after_connack() {
    let mut h = start_default();
    let client = h.client.clone();

    let (granted, _conn) = tokio::join!(client.subscribe("late/#", QoS::AtMostOnce), async {
        let mut conn = h.connect(false).await;
        let subscribe = conn.expect_subscribe().await;
        assert_eq!(subscribe.filters[0].filter, "late/#");
        conn.send_suback(subscribe.packet_id, &[0]).await;
        conn
    });

    assert_eq!(granted.unwrap(), QoS::AtMostOnce);
}

#[tokio::test]
async fn test_state_tracks_connection() {
    let mut h = start_default();
    let initial = h.client.state();
    assert!(!initial.is_connected());
    assert_eq!(initial.supervisor, SupervisorState::Idle);

    let _conn = h.connect(false).await;
    let state = h.client.state();
    assert!(state.is_connected());
    assert_eq!(state.supervisor, SupervisorState::Connected);

    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json["connection"]["state"], "connected");
    assert_eq!(json["supervisor"]["state"], "connected");
}

#[tokio::test]
async fn test_connect_when_connected_is_a_no_op() {
    let mut h = start_default();
    let _conn = h.connect(false).await;

    h.client.connect().await.unwrap();

    assert_eq!(h.connector.open_count(), 1);
}

#[tokio::test]
async fn test_dropping_last_handle_disconnects() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    drop(h.client);

    assert_eq!(conn.expect_packet().await, Packet::Disconnect(Disconnect::default()));
    assert!(conn.recv().await.is_none());
}

#[tokio::test]
async fn test_callback_sink_receives_names_and_payloads() {
    let (connector, mut broker) = MockConnector::new(ProtocolVersion::V311);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&seen);
    let sink = CallbackSink::new(move |name, payload| {
        captured.lock().unwrap().push((name.to_string(), payload));
    });
    let client = Client::with_connector(test_config(), Arc::new(sink), Arc::new(connector)).unwrap();

    let (result, _conn) = tokio::join!(client.connect(), async {
        let mut conn = broker.accept().await.unwrap();
        conn.handshake(true).await;
        conn
    });
    result.unwrap();
    client.subscriptions().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0, "connected");
    assert_eq!(seen[0].1["session_present"], true);
}

/// Sink that holds every event until the gate opens.
struct GatedSink {
    gate: watch::Receiver<bool>,
    inner: Arc<RecordingSink>,
}

#[async_trait]
impl EventSink for GatedSink {
    async fn emit(&self, event: ClientEvent) {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.emit(event).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_consumer_pauses_inbound_processing() {
    let (connector, mut broker) = MockConnector::new(ProtocolVersion::V311);
    let (gate_tx, gate_rx) = watch::channel(false);
    let recorder = RecordingSink::new();
    let sink = GatedSink {
        gate: gate_rx,
        inner: Arc::clone(&recorder),
    };
    let client = Client::with_connector(
        test_config().with_event_buffer(1),
        Arc::new(sink),
        Arc::new(connector),
    )
    .unwrap();

    let (result, mut conn) = tokio::join!(client.connect(), async {
        let mut conn = broker.accept().await.unwrap();
        conn.handshake(false).await;
        conn
    });
    result.unwrap();

    for id in 1..=100u16 {
        conn.send_publish("burst", b"x", QoS::AtLeastOnce, Some(id)).await;
    }

    let mut acked = 0;
    while let Some(packet) = conn.recv_within(Duration::from_secs(1)).await {
        assert!(matches!(packet, Packet::PubAck(_)));
        acked += 1;
    }
    assert!(acked > 0 && acked < 100, "acked {acked} while the consumer was stalled");

    gate_tx.send(true).unwrap();
    while acked < 100 {
        match conn.recv_within(Duration::from_secs(5)).await {
            Some(Packet::PubAck(_)) => acked += 1,
            other => panic!("expected PUBACK, got {other:?}"),
        }
    }
    recorder.wait_for_nth("message", 100).await;
    assert_eq!(recorder.names()[0], "connected");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_consumer_does_not_trip_keep_alive() {
    let (connector, mut broker) = MockConnector::new(ProtocolVersion::V311);
    let opens = connector.clone();
    let (gate_tx, gate_rx) = watch::channel(false);
    let recorder = RecordingSink::new();
    let sink = GatedSink {
        gate: gate_rx,
        inner: Arc::clone(&recorder),
    };
    let client = Client::with_connector(
        test_config().with_keep_alive(5).with_event_buffer(1),
        Arc::new(sink),
        Arc::new(connector),
    )
    .unwrap();

    let (result, mut conn) = tokio::join!(client.connect(), async {
        let mut conn = broker.accept().await.unwrap();
        conn.handshake(false).await;
        conn
    });
    result.unwrap();

    for _ in 0..100 {
        conn.send_publish("burst", b"x", QoS::AtMostOnce, None).await;
    }

    // Answer every ping while the consumer stays stalled for several intervals
    let stalled_until = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < stalled_until {
        if let Some(Packet::PingReq) = conn.recv_within(Duration::from_secs(1)).await {
            conn.send(Packet::PingResp).await;
        }
    }
    assert!(client.state().is_connected());

    gate_tx.send(true).unwrap();
    recorder.wait_for_nth("message", 100).await;
    assert_eq!(recorder.count("disconnected"), 0);
    assert_eq!(opens.open_count(), 1);
    assert!(client.state().is_connected());
}
