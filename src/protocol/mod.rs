//! MQTT wire protocol: packet model, binary codec and topic validation
//!
//! Supports MQTT 3.1.1 and MQTT 5. Nothing in this module holds connection
//! state beyond the protocol revision a [`Codec`] was built for.

pub mod codec;
pub mod packet;
pub mod properties;
pub mod topics;

pub use codec::{decode_remaining_length, Codec, Decoder, ProtocolError, MAX_REMAINING_LENGTH};
pub use packet::*;
pub use properties::{Properties, Property, PropertyValue};
pub use topics::{topic_matches, validate_topic_filter, validate_topic_name, TopicError};
