//! Events emitted to the embedder
//!
//! Every [`ClientEvent`] has a stable `name()` and a JSON `payload()`, which is
//! all a binding layer needs to forward it across a language boundary. Events
//! reach the embedder through an [`EventSink`].

use crate::error::ErrorKind;
use crate::protocol::QoS;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected {
        session_present: bool,
    },
    Disconnected {
        reason: String,
    },
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
    Subscribed {
        filter: String,
        granted_qos: QoS,
    },
    Unsubscribed {
        filter: String,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Connected { .. } => "connected",
            ClientEvent::Disconnected { .. } => "disconnected",
            ClientEvent::Message { .. } => "message",
            ClientEvent::Error { .. } => "error",
            ClientEvent::Subscribed { .. } => "subscribed",
            ClientEvent::Unsubscribed { .. } => "unsubscribed",
            ClientEvent::Reconnecting { .. } => "reconnecting",
        }
    }

    /// Structured payload; message bodies that are not UTF-8 become byte arrays.
    pub fn payload(&self) -> Value {
        match self {
            ClientEvent::Connected { session_present } => {
                json!({ "session_present": session_present })
            }
            ClientEvent::Disconnected { reason } => json!({ "reason": reason }),
            ClientEvent::Message {
                topic,
                payload,
                qos,
                retain,
            } => {
                let body = match std::str::from_utf8(payload) {
                    Ok(text) => Value::String(text.to_string()),
                    Err(_) => Value::from(payload.to_vec()),
                };
                json!({
                    "topic": topic,
                    "payload": body,
                    "qos": u8::from(*qos),
                    "retain": retain,
                })
            }
            ClientEvent::Error { kind, detail } => json!({ "kind": kind, "detail": detail }),
            ClientEvent::Subscribed {
                filter,
                granted_qos,
            } => json!({ "filter": filter, "granted_qos": u8::from(*granted_qos) }),
            ClientEvent::Unsubscribed { filter } => json!({ "filter": filter }),
            ClientEvent::Reconnecting { attempt, delay_ms } => {
                json!({ "attempt": attempt, "delay_ms": delay_ms })
            }
        }
    }
}

/// Receives every event in emission order.
///
/// `emit` may wait; while it does, the client stops reading from the broker.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ClientEvent);
}

/// Forwards events into a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ClientEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<ClientEvent>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ClientEvent) {
        if self.sender.send(event).await.is_err() {
            debug!(target: "mqtt_client", "Event receiver dropped");
        }
    }
}

type Callback = Box<dyn Fn(&str, Value) + Send + Sync>;

/// Calls a closure with `(event_name, payload)` for each event.
pub struct CallbackSink {
    callback: Callback,
}

impl CallbackSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSink for CallbackSink {
    async fn emit(&self, event: ClientEvent) {
        (self.callback)(event.name(), event.payload());
    }
}
