//! Testing utilities and mock implementations
//!
//! Drives the client against a scripted in-memory broker without network
//! access or a real MQTT server.

pub mod mocks;

pub use mocks::*;
