//! Pluggable serialisation for transport frames.
//!
//! The transport never interprets payloads.  A [`Codec`] turns outbound
//! [`Value`]s into frame bytes and inbound frame bytes back into values; the
//! default [`JsonCodec`] speaks plain JSON.

use serde_json::Value;
use skylink_types::LinkError;

/// Encoder/decoder pair used for every frame on the wire.
pub trait Codec: Send + Sync {
    /// Serialise an outbound value into frame bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, LinkError>;

    /// Deserialise inbound frame bytes.
    fn decode(&self, bytes: &[u8]) -> Result<Value, LinkError>;
}

/// UTF-8 JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, LinkError> {
        serde_json::to_vec(value).map_err(|e| LinkError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, LinkError> {
        serde_json::from_slice(bytes).map_err(|e| LinkError::Codec(e.to_string()))
    }
}
