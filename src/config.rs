//! Client configuration
//!
//! A [`ClientConfig`] is loaded from TOML or assembled in code with the
//! `with_*` builders. It is validated before a connection attempt starts and
//! not modified afterwards; reconfiguring means `Client::reconnect_with`.
//!
//! ```toml
//! broker_url = "mqtts://broker.example.com"
//! client_id = "sensor-17"
//! keep_alive_secs = 30
//! clean_start = false
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//!
//! [will]
//! topic = "sensors/17/status"
//! payload = "offline"
//! qos = 1
//! retain = true
//!
//! [reconnect]
//! base_delay_ms = 500
//! max_attempts = 10
//! ```

use crate::protocol::{
    validate_topic_name, Connect, LastWill, Properties, ProtocolVersion, QoS, MAX_REMAINING_LENGTH,
};
use crate::reconnect::ReconnectConfig;
use crate::transport::{BrokerAddress, TlsOptions};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// `tcp://`, `mqtt://`, `ssl://` or `mqtts://`, port optional
    pub broker_url: String,
    #[serde(default = "generate_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub protocol: ProtocolVersion,
    /// Seconds; 0 disables keep-alive
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    pub will: Option<WillConfig>,
    #[serde(default)]
    pub tls: TlsOptions,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Bounds inbound packets and outbound payloads
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Capacity of the event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Re-issue remembered subscriptions when the broker lost the session
    #[serde(default = "default_resubscribe")]
    pub resubscribe_on_session_loss: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

fn default_keep_alive() -> u16 {
    60
}

fn default_clean_start() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_packet_size() -> usize {
    MAX_REMAINING_LENGTH
}

fn default_event_buffer() -> usize {
    64
}

fn default_resubscribe() -> bool {
    true
}

/// Random client identifier of the form `mqtt_1a2b3c4d`
pub fn generate_client_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("mqtt_{}", &simple[..8])
}

impl ClientConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: generate_client_id(),
            protocol: ProtocolVersion::default(),
            keep_alive_secs: default_keep_alive(),
            clean_start: default_clean_start(),
            connect_timeout_secs: default_connect_timeout(),
            username: None,
            password: None,
            username_env: None,
            password_env: None,
            will: None,
            tls: TlsOptions::default(),
            reconnect: ReconnectConfig::default(),
            max_packet_size: default_max_packet_size(),
            event_buffer: default_event_buffer(),
            resubscribe_on_session_loss: default_resubscribe(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_will(mut self, will: WillConfig) -> Self {
        self.will = Some(will);
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_address()?;

        if self.client_id.is_empty() && !self.clean_start {
            return Err(ConfigError::InvalidConfig(
                "an empty client_id requires clean_start = true".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_packet_size must be at least 1".to_string(),
            ));
        }
        if let Some(will) = &self.will {
            validate_topic_name(&will.topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("invalid will topic '{}': {e}", will.topic))
            })?;
        }
        self.reconnect.validate().map_err(ConfigError::InvalidConfig)?;
        Ok(())
    }

    fn parse_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.broker_url).map_err(|e| ConfigError::InvalidBrokerUrl {
            url: self.broker_url.clone(),
            reason: e.to_string(),
        })
    }

    /// Host, port and TLS flag derived from `broker_url` and `tls`
    pub fn broker_address(&self) -> Result<BrokerAddress, ConfigError> {
        let url = self.parse_url()?;
        let invalid = |reason: &str| ConfigError::InvalidBrokerUrl {
            url: self.broker_url.clone(),
            reason: reason.to_string(),
        };

        let (tls, default_port) = match url.scheme() {
            "tcp" | "mqtt" => (false, 1883),
            "ssl" | "mqtts" | "tls" => (true, 8883),
            _ => return Err(invalid("scheme must be tcp, mqtt, ssl or mqtts")),
        };
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;

        Ok(BrokerAddress {
            host: host.to_string(),
            port: url.port().unwrap_or(default_port),
            tls: tls || self.tls.enabled,
        })
    }

    /// TLS options for the connector, when TLS is in use
    pub fn tls_options(&self) -> Option<TlsOptions> {
        let tls = self.broker_address().map(|a| a.tls).unwrap_or(self.tls.enabled);
        tls.then(|| self.tls.clone())
    }

    /// Credentials for CONNECT: direct values, then environment, then the URL.
    pub fn resolve_credentials(&self) -> Result<(Option<String>, Option<String>), ConfigError> {
        let url = self.parse_url()?;
        let from_url_user = (!url.username().is_empty()).then(|| url.username().to_string());
        let from_url_pass = url.password().map(str::to_string);

        let username = match (&self.username, &self.username_env) {
            (Some(direct), _) => Some(direct.clone()),
            (None, Some(var)) => Some(get_env_var_required(var)?),
            (None, None) => from_url_user,
        };
        let password = match (&self.password, &self.password_env) {
            (Some(direct), _) => Some(direct.clone()),
            (None, Some(var)) => Some(get_env_var_required(var)?),
            (None, None) => from_url_pass,
        };
        Ok((username, password))
    }

    /// CONNECT packet for this configuration
    pub fn connect_packet(&self) -> Result<Connect, ConfigError> {
        let (username, password) = self.resolve_credentials()?;
        if password.is_some() && username.is_none() && self.protocol == ProtocolVersion::V311 {
            return Err(ConfigError::InvalidConfig(
                "MQTT 3.1.1 requires a username when a password is set".to_string(),
            ));
        }
        Ok(Connect {
            protocol: self.protocol,
            client_id: self.client_id.clone(),
            clean_start: self.clean_start,
            keep_alive: self.keep_alive_secs,
            username,
            password: password.map(Bytes::from),
            will: self.will.as_ref().map(|will| LastWill {
                topic: will.topic.clone(),
                payload: Bytes::from(will.payload.clone()),
                qos: will.qos,
                retain: will.retain,
                properties: Properties::default(),
            }),
            properties: Properties::default(),
        })
    }

    /// Configuration with secrets removed, for `mqttc config --show`
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some("***".to_string());
        }
        if let Ok(mut url) = self.parse_url() {
            if url.password().is_some() && url.set_password(Some("***")).is_ok() {
                copy.broker_url = url.to_string();
            }
        }
        copy
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}
