//! MQTT client engine
//!
//! An asynchronous MQTT 3.1.1 / 5 client that keeps its session across
//! connection drops: QoS 1 and 2 messages survive reconnects and are resumed in
//! order, subscriptions are restored when the broker loses the session, and a
//! supervisor reconnects with exponential backoff.
//!
//! # Layers
//!
//! - [`protocol`] - packet model and the binary codec
//! - [`transport`] - TCP and TLS byte streams behind the [`transport::Connector`] trait
//! - [`session`] - in-flight messages, inbound QoS 2 state and subscriptions
//! - [`connection`] - one physical connection: handshake and keep-alive
//! - [`delivery`] - QoS 0/1/2 flows on top of the session
//! - [`reconnect`] - backoff policy and the supervisor state machine
//! - [`client`] - the [`Client`] handle and the event loop behind it
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_client_engine::{Client, ClientConfig, ClientEvent, QoS};
//!
//! # async fn demo() -> Result<(), mqtt_client_engine::ClientError> {
//! let config = ClientConfig::new("mqtt://broker.local:1883").with_client_id("sensor-7");
//! let (client, mut events) = Client::channel(config)?;
//!
//! client.connect().await?;
//! client.subscribe("commands/sensor-7", QoS::ExactlyOnce).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::Message { topic, payload, .. } = event {
//!         client.publish("acks/sensor-7", payload, QoS::AtLeastOnce, false).await?;
//!         println!("handled {topic}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod testing;
pub mod transport;

pub use client::{CallbackSink, ChannelSink, Client, ClientEvent, ClientState, EventSink};
pub use config::{ClientConfig, ConfigError, WillConfig};
pub use error::{ApplicationError, ClientError, ClientResult, ErrorKind};
pub use protocol::{ProtocolVersion, QoS};
pub use reconnect::{ReconnectConfig, SupervisorState};
pub use transport::TlsOptions;
