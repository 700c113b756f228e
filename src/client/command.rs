//! Requests from [`Client`](super::Client) handles to the event loop

use crate::config::ClientConfig;
use crate::delivery::InFlightSummary;
use crate::error::ClientResult;
use crate::protocol::QoS;
use crate::session::OutboundMessage;
use tokio::sync::oneshot;

pub(crate) type Reply<T> = oneshot::Sender<ClientResult<T>>;

pub(crate) enum Command {
    Connect {
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Publish {
        message: OutboundMessage,
        reply: Reply<()>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        reply: Reply<QoS>,
    },
    Unsubscribe {
        filter: String,
        reply: Reply<()>,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<(String, QoS)>>,
    },
    InFlight {
        reply: oneshot::Sender<Vec<InFlightSummary>>,
    },
    AbandonInFlight {
        reply: oneshot::Sender<usize>,
    },
    Reconfigure {
        config: Box<ClientConfig>,
        reply: Reply<()>,
    },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::Publish { .. } => "publish",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Subscriptions { .. } => "subscriptions",
            Command::InFlight { .. } => "in_flight",
            Command::AbandonInFlight { .. } => "abandon_in_flight",
            Command::Reconfigure { .. } => "reconfigure",
        }
    }
}

/// Work accepted while no connection is up, replayed in issuance order.
pub(crate) enum Queued {
    Publish {
        message: OutboundMessage,
        reply: Option<Reply<()>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        reply: Option<Reply<QoS>>,
    },
    Unsubscribe {
        filter: String,
        reply: Option<Reply<()>>,
    },
}

/// SUBSCRIBE or UNSUBSCRIBE written and waiting for its acknowledgement.
pub(crate) enum PendingRequest {
    Subscribe {
        filter: String,
        qos: QoS,
        reply: Option<Reply<QoS>>,
    },
    Unsubscribe {
        filter: String,
        reply: Option<Reply<()>>,
    },
}

impl PendingRequest {
    /// Turns an unanswered request back into queued work for the next connection.
    pub(crate) fn requeue(self) -> Queued {
        match self {
            PendingRequest::Subscribe { filter, qos, reply } => Queued::Subscribe { filter, qos, reply },
            PendingRequest::Unsubscribe { filter, reply } => Queued::Unsubscribe { filter, reply },
        }
    }
}
