//! Transport layer for the MQTT engine
//!
//! A [`Connector`] opens a [`Transport`]: an ordered, bidirectional byte stream
//! to the broker. The engine owns exactly one transport per physical
//! connection and never shares it between tasks.

use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt;
use std::io;
use thiserror::Error;

pub mod tcp;
pub mod tls;

pub use tcp::{StreamTransport, TcpConnector};
pub use tls::TlsOptions;

/// Where to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    /// Wrap the TCP stream in TLS
    pub tls: bool,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Failure to establish a session with the broker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("DNS resolution failed for {host}: {detail}")]
    Dns { host: String, detail: String },

    #[error("TCP connection to {addr} failed: {detail}")]
    Tcp { addr: String, detail: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Broker refused connection: {reason} (code {code:#04x})")]
    Refused { code: u8, reason: String },

    #[error("Connection attempt timed out after {0} ms")]
    Timeout(u64),

    #[error("Transport closed before CONNACK")]
    ClosedBeforeConnAck,

    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),
}

impl ConnectError {
    /// True when the broker itself answered the CONNECT with a refusal
    pub fn is_refusal(&self) -> bool {
        matches!(self, ConnectError::Refused { .. })
    }
}

/// Outcome of a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were appended to the buffer
    Data(usize),
    /// The peer closed the stream
    Closed,
}

/// Bidirectional byte stream to the broker.
#[async_trait]
pub trait Transport: Send {
    /// Appends whatever bytes are available to `buf`.
    ///
    /// Must be cancel-safe: if the future is dropped before completing, no
    /// bytes are lost.
    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<ReadStatus>;

    /// Writes and flushes all of `bytes`
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Best-effort shutdown of the stream
    async fn close(&mut self);
}

/// Factory for transports, one per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        address: &BrokerAddress,
        tls: Option<&TlsOptions>,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}
