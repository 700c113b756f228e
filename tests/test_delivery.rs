//! QoS delivery through the client against a scripted broker
//!
//! Covers acknowledgement flows in both directions and what happens to
//! unfinished flows when the connection drops.


use client_harness::{start, start_default, start_v5, test_config};
use mqtt_client_engine::protocol::{Ack, Packet};
use mqtt_client_engine::session::OutboundState;
use mqtt_client_engine::{ClientError, ClientEvent, QoS};

#[tokio::test]
async fn test_qos1_publish_resolves_on_puback() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    let (result, ()) = tokio::join!(
        h.client.publish("sensors/1", "21.5", QoS::AtLeastOnce, false),
        async {
            let publish = conn.expect_publish().await;
            assert_eq!(publish.topic, "sensors/1");
            assert!(!publish.dup);
            conn.send_puback(publish.packet_id.unwrap()).await;
        }
    );

    result.unwrap();
    assert!(h.client.in_flight().await.unwrap().is_empty());
    let metrics = h.client.metrics();
    assert_eq!(metrics.messages.published, 1);
    assert_eq!(metrics.messages.acknowledged, 1);
}

#[tokio::test]
async fn test_qos0_publish_resolves_once_written() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    h.client
        .publish("fire/and/forget", "x", QoS::AtMostOnce, false)
        .await
        .unwrap();

    let publish = conn.expect_publish().await;
    assert_eq!(publish.packet_id, None);
}

#[tokio::test]
async fn test_qos2_publish_completes_four_way_handshake() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    let (result, ()) = tokio::join!(
        h.client.publish("orders/42", "paid", QoS::ExactlyOnce, false),
        async {
            let publish = conn.expect_publish().await;
            let id = publish.packet_id.unwrap();
            conn.send(Packet::PubRec(Ack::new(id))).await;
            match conn.expect_packet().await {
                Packet::PubRel(ack) => assert_eq!(ack.packet_id, id),
                other => panic!("expected PUBREL, got {}", other.name()),
            }
            conn.send(Packet::PubComp(Ack::new(id))).await;
        }
    );

    result.unwrap();
}

#[tokio::test]
async fn test_unacked_publishes_resume_in_order_with_dup_flag() {
    let mut h = start(test_config().with_clean_start(false));
    let mut conn = h.connect(false).await;

    let mut pending = Vec::new();
    let mut first_ids = Vec::new();
    for n in 0..3 {
        let client = h.client.clone();
        pending.push(tokio::spawn(async move {
            client
                .publish(format!("log/{n}"), "entry", QoS::AtLeastOnce, false)
                .await
        }));
        let publish = conn.expect_publish().await;
        assert_eq!(publish.topic, format!("log/{n}"));
        first_ids.push(publish.packet_id.unwrap());
    }

    let in_flight = h.client.in_flight().await.unwrap();
    assert_eq!(in_flight.len(), 3);
    assert!(in_flight.iter().all(|m| m.state == OutboundState::AwaitPuback));

    conn.close().await;
    let mut conn = h.accept_reconnect(true).await;

    for (n, id) in first_ids.iter().enumerate() {
        let publish = conn.expect_publish().await;
        assert_eq!(publish.topic, format!("log/{n}"));
        assert_eq!(publish.packet_id, Some(*id));
        assert!(publish.dup, "retransmission must set DUP");
        conn.send_puback(*id).await;
    }

    for handle in pending {
        handle.await.unwrap().unwrap();
    }

    // A late second PUBACK for a completed message changes nothing
    conn.send_puback(first_ids[0]).await;
    conn.send_publish("sync", b"", QoS::AtMostOnce, None).await;
    h.sink.wait_for("message").await;

    let metrics = h.client.metrics();
    assert_eq!(metrics.messages.retransmitted, 3);
    assert_eq!(metrics.messages.acknowledged, 3);
    assert_eq!(h.sink.count("error"), 0);
    assert!(h.client.in_flight().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_qos2_after_pubrec_resumes_with_pubrel() {
    let mut h = start(test_config().with_clean_start(false));
    let mut conn = h.connect(false).await;

    let client = h.client.clone();
    let pending =
        tokio::spawn(async move { client.publish("orders/7", "x", QoS::ExactlyOnce, false).await });

    let id = conn.expect_publish().await.packet_id.unwrap();
    conn.send(Packet::PubRec(Ack::new(id))).await;
    assert!(matches!(conn.expect_packet().await, Packet::PubRel(_)));
    conn.close().await;

    let mut conn = h.accept_reconnect(true).await;
    match conn.expect_packet().await {
        Packet::PubRel(ack) => assert_eq!(ack.packet_id, id),
        other => panic!("expected PUBREL, not {}", other.name()),
    }
    conn.send(Packet::PubComp(Ack::new(id))).await;

    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inbound_qos2_duplicate_is_delivered_once() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    conn.send_publish("cmd/reboot", b"now", QoS::ExactlyOnce, Some(7)).await;
    assert_eq!(conn.expect_packet().await, Packet::PubRec(Ack::new(7)));

    // Broker missed the PUBREC and retransmits
    conn.send_publish("cmd/reboot", b"now", QoS::ExactlyOnce, Some(7)).await;
    assert_eq!(conn.expect_packet().await, Packet::PubRec(Ack::new(7)));

    conn.send(Packet::PubRel(Ack::new(7))).await;
    assert_eq!(conn.expect_packet().await, Packet::PubComp(Ack::new(7)));

    conn.send_publish("cmd/status", b"ok", QoS::AtMostOnce, None).await;
    let last = h.sink.wait_for_nth("message", 2).await;
    assert!(matches!(last, ClientEvent::Message { ref topic, .. } if topic == "cmd/status"));
    assert_eq!(h.sink.count("message"), 2);
    assert_eq!(h.client.metrics().messages.duplicates_suppressed, 1);
}

#[tokio::test]
async fn test_inbound_qos1_is_acknowledged_and_delivered() {
    let mut h = start_default();
    let mut conn = h.connect(false).await;

    conn.send_publish("a/b", b"payload", QoS::AtLeastOnce, Some(3)).await;
    assert_eq!(conn.expect_packet().await, Packet::PubAck(Ack::new(3)));

    let event = h.sink.wait_for("message").await;
    assert_eq!(
        event.payload()["payload"],
        serde_json::json!("payload")
    );
}

#[tokio::test]
async fn test_session_loss_rejects_in_flight_and_resubscribes() {
    let mut h = start(test_config().with_clean_start(false));
    let mut conn = h.connect(false).await;

    let (granted, ()) = tokio::join!(h.client.subscribe("alerts/#", QoS::AtLeastOnce), async {
        let subscribe = conn.expect_subscribe().await;
        conn.send_suback(subscribe.packet_id, &[1]).await;
    });
    assert_eq!(granted.unwrap(), QoS::AtLeastOnce);

    let client = h.client.clone();
    let pending =
        tokio::spawn(async move { client.publish("alerts/1", "x", QoS::AtLeastOnce, false).await });
    conn.expect_publish().await;
    conn.close().await;

    // Broker comes back without the session
    let mut conn = h.accept_reconnect(false).await;

    let error = pending.await.unwrap().unwrap_err();
    assert!(matches!(error, ClientError::SessionLost));

    let subscribe = conn.expect_subscribe().await;
    assert_eq!(subscribe.filters[0].filter, "alerts/#");
    assert_eq!(subscribe.filters[0].options.qos, QoS::AtLeastOnce);
    conn.send_suback(subscribe.packet_id, &[1]).await;

    h.sink.wait_for_nth("subscribed", 2).await;
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, ClientEvent::Error { detail, .. } if detail.contains("resume the session"))));
    assert_eq!(h.client.metrics().connection.sessions_lost, 1);
}

#[tokio::test]
async fn test_publish_during_backoff_is_sent_after_reconnect() {
    let mut h = start_default();
    let conn = h.connect(false).await;
    conn.close().await;
    h.sink.wait_for("reconnecting").await;

    let client = h.client.clone();
    let pending =
        tokio::spawn(async move { client.publish("queued/1", "x", QoS::AtLeastOnce, false).await });

    let mut conn = h.accept_reconnect(false).await;
    let publish = conn.expect_publish().await;
    assert_eq!(publish.topic, "queued/1");
    assert!(!publish.dup);
    conn.send_puback(publish.packet_id.unwrap()).await;

    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_v5_negative_puback_rejects_publish() {
    let mut h = start_v5();
    let mut conn = h.connect(false).await;

    let (result, ()) = tokio::join!(
        h.client.publish("restricted/topic", "x", QoS::AtLeastOnce, false),
        async {
            let publish = conn.expect_publish().await;
            let mut ack = Ack::new(publish.packet_id.unwrap());
            ack.reason_code = 0x87;
            conn.send(Packet::PubAck(ack)).await;
        }
    );

    assert!(matches!(
        result,
        Err(ClientError::Rejected { code: 0x87, .. })
    ));
    assert!(h.client.in_flight().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_abandon_in_flight_releases_waiters() {
    let mut h = start(test_config().with_clean_start(false));
    let mut conn = h.connect(false).await;

    let client = h.client.clone();
    let pending =
        tokio::spawn(async move { client.publish("slow/1", "x", QoS::AtLeastOnce, false).await });
    conn.expect_publish().await;

    assert_eq!(h.client.abandon_in_flight().await.unwrap(), 1);
    assert!(matches!(pending.await.unwrap(), Err(ClientError::Abandoned)));
    assert!(h.client.in_flight().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resumed_session_keeps_subscriptions_without_resubscribing() {
    let mut h = start(test_config().with_clean_start(false));
    let mut conn = h.connect(false).await;

    let (granted, ()) = tokio::join!(h.client.subscribe("a/b", QoS::AtLeastOnce), async {
        let subscribe = conn.expect_subscribe().await;
        conn.send_suback(subscribe.packet_id, &[1]).await;
    });
    granted.unwrap();
    conn.close().await;

    let mut conn = h.accept_reconnect(true).await;

    assert!(conn.recv_within(std::time::Duration::from_millis(200)).await.is_none());
    assert_eq!(
        h.client.subscriptions().await.unwrap(),
        vec![("a/b".to_string(), QoS::AtLeastOnce)]
    );
    assert_eq!(h.sink.count("subscribed"), 1);
}
