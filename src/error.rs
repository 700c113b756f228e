//! Error types for the MQTT client engine
//!
//! Every facade operation resolves to [`ClientError`]. Its [`ErrorKind`] is the
//! category reported in `error` events: connect, protocol, application, io,
//! session or client.

use crate::config::ConfigError;
use crate::protocol::{ProtocolError, TopicError};
use crate::session::SessionError;
use crate::transport::ConnectError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Invalid requests, rejected before anything reaches the network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("Invalid topic name: {0}")]
    InvalidTopicName(TopicError),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(TopicError),

    #[error("Payload of {size} bytes exceeds the maximum packet size of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid QoS {0}")]
    InvalidQos(u8),
}

/// Main error type for client operations
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Application(#[from] ApplicationError),

    #[error("Transport I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Transport closed by broker")]
    ConnectionClosed,

    #[error("No PINGRESP within {0} ms")]
    KeepAliveTimeout(u64),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Broker did not resume the session; in-flight state was discarded")]
    SessionLost,

    #[error("Not connected")]
    NotConnected,

    #[error("Gave up reconnecting after {0} attempts")]
    GivenUp(u32),

    #[error("In-flight message abandoned")]
    Abandoned,

    #[error("Broker rejected {operation} of '{filter}' (code {code:#04x})")]
    Rejected {
        operation: &'static str,
        filter: String,
        code: u8,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Client has shut down")]
    Shutdown,
}

impl From<std::io::Error> for ClientError {
    fn from(error: std::io::Error) -> Self {
        ClientError::Io(Arc::new(error))
    }
}

impl From<ConfigError> for ClientError {
    fn from(error: ConfigError) -> Self {
        ClientError::InvalidConfig(error.to_string())
    }
}

/// Category of a failure as reported to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    Protocol,
    Application,
    Io,
    Session,
    Client,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connect => "connect",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Application => "application",
            ErrorKind::Io => "io",
            ErrorKind::Session => "session",
            ErrorKind::Client => "client",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connect(_) => ErrorKind::Connect,
            ClientError::Protocol(_) => ErrorKind::Protocol,
            ClientError::Application(_) | ClientError::InvalidConfig(_) => ErrorKind::Application,
            ClientError::Io(_) | ClientError::ConnectionClosed | ClientError::KeepAliveTimeout(_) => {
                ErrorKind::Io
            }
            ClientError::Session(_) | ClientError::SessionLost | ClientError::Abandoned => {
                ErrorKind::Session
            }
            ClientError::NotConnected
            | ClientError::GivenUp(_)
            | ClientError::Rejected { .. }
            | ClientError::InvalidState(_)
            | ClientError::Shutdown => ErrorKind::Client,
        }
    }

    /// Failures that end the current physical connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connect | ErrorKind::Protocol | ErrorKind::Io
        )
    }

    /// Message safe to hand to the embedder
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

const MAX_DETAIL_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").ok());

static URL_CREDENTIALS_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)([a-z]+://)[^/@\s:]+(:[^/@\s]*)?@").ok());

/// Redacts credentials and caps the length of an error detail.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").into_owned();
    }
    // user:pass@ in broker URLs
    if let Some(pattern) = URL_CREDENTIALS_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}***@").into_owned();
    }

    if sanitized.len() > MAX_DETAIL_LEN {
        let mut cut = MAX_DETAIL_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

pub type ClientResult<T> = Result<T, ClientError>;
