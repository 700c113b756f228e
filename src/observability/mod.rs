//! Observability: structured logging and client metrics
//!
//! Logging goes through `tracing`; metrics are in-process counters exposed as
//! a serializable [`MetricsSnapshot`] through `Client::metrics`.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{ClientMetrics, ConnectionMetrics, MessageMetrics, MetricsSnapshot};
