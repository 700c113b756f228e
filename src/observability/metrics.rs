//! Per-client metrics
//!
//! Each client owns one [`ClientMetrics`] behind an `Arc`; the event loop
//! updates it and embedders read consistent-enough snapshots at any time.
//! Nothing here is process-wide.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Number of acknowledgement latencies kept for percentiles
const LATENCY_WINDOW: usize = 1024;

#[derive(Debug)]
pub struct ClientMetrics {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    sessions_lost: AtomicU64,
    messages_published: AtomicU64,
    messages_acknowledged: AtomicU64,
    messages_retransmitted: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    duplicates_suppressed: AtomicU64,
    pings_sent: AtomicU64,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    ack_latencies: Mutex<VecDeque<u64>>,
    created_at: DateTime<Utc>,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            sessions_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            messages_acknowledged: AtomicU64::new(0),
            messages_retransmitted: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            connected_since: Mutex::new(None),
            ack_latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            created_at: Utc::now(),
        }
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        if let Ok(mut since) = self.connected_since.lock() {
            *since = Some(Utc::now());
        }
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connection_lost();
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Ok(mut since) = self.connected_since.lock() {
            *since = None;
        }
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_lost(&self) {
        self.sessions_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_acknowledged(&self, latency: Duration) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = self.ack_latencies.lock() {
            if latencies.len() == LATENCY_WINDOW {
                latencies.pop_front();
            }
            latencies.push_back(latency.as_millis() as u64);
        }
    }

    pub fn message_retransmitted(&self) {
        self.messages_retransmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_percentiles(&self) -> (f64, f64, f64) {
        let mut sorted: Vec<u64> = match self.ack_latencies.lock() {
            Ok(latencies) => latencies.iter().copied().collect(),
            Err(_) => Vec::new(),
        };
        sorted.sort_unstable();
        (
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let connected_since = self.connected_since.lock().ok().and_then(|since| *since);
        let (p50, p95, p99) = self.latency_percentiles();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                sessions_lost: self.sessions_lost.load(Ordering::Relaxed),
                pings_sent: self.pings_sent.load(Ordering::Relaxed),
                connected_since,
                connection_duration_seconds: connected_since
                    .map(|since| (now - since).num_seconds().max(0) as u64)
                    .unwrap_or(0),
            },
            messages: MessageMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
                retransmitted: self.messages_retransmitted.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                received: self.messages_received.load(Ordering::Relaxed),
                duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
                ack_latency_p50_ms: p50,
                ack_latency_p95_ms: p95,
                ack_latency_p99_ms: p99,
            },
            uptime_seconds: (now - self.created_at).num_seconds().max(0) as u64,
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub sessions_lost: u64,
    pub pings_sent: u64,
    pub connected_since: Option<DateTime<Utc>>,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub published: u64,
    pub acknowledged: u64,
    pub retransmitted: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub duplicates_suppressed: u64,
    pub ack_latency_p50_ms: f64,
    pub ack_latency_p95_ms: f64,
    pub ack_latency_p99_ms: f64,
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let metrics = ClientMetrics::new();
        metrics.connection_attempt();
        metrics.connection_attempt();
        metrics.connection_failed();
        metrics.connection_established();

        let snapshot = metrics.snapshot();
        assert!(snapshot.connection.connected);
        assert_eq!(snapshot.connection.connection_attempts, 2);
        assert_eq!(snapshot.connection.connection_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert!(snapshot.connection.connected_since.is_some());

        metrics.connection_lost();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.connection_duration_seconds, 0);
    }

    #[test]
    fn test_message_metrics() {
        let metrics = ClientMetrics::new();
        metrics.message_published();
        metrics.message_acknowledged(Duration::from_millis(10));
        metrics.message_acknowledged(Duration::from_millis(30));
        metrics.message_received();
        metrics.duplicate_suppressed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages.published, 1);
        assert_eq!(snapshot.messages.acknowledged, 2);
        assert_eq!(snapshot.messages.received, 1);
        assert_eq!(snapshot.messages.duplicates_suppressed, 1);
        assert_eq!(snapshot.messages.ack_latency_p50_ms, 20.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = ClientMetrics::new();
        for i in 0..(LATENCY_WINDOW as u64 + 10) {
            metrics.message_acknowledged(Duration::from_millis(i));
        }
        assert_eq!(metrics.ack_latencies.lock().unwrap().len(), LATENCY_WINDOW);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(ClientMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.message_received();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().messages.received, 400);
    }

    #[test]
    fn test_percentile_calculation() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[5], 99.0), 5.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 50.0), 3.0);
        assert_eq!(percentile(&[0, 10], 50.0), 5.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(ClientMetrics::new().snapshot()).unwrap();
        assert_eq!(json["connection"]["connected"], false);
        assert_eq!(json["messages"]["published"], 0);
    }
}
