// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codec
//!
//! Pluggable serialization seam for message payloads. The connection manager
//! encodes every outbound payload and decodes every inbound one through a
//! [`PayloadCodec`]; the default is JSON via `serde_json`.

use crate::errors::AmqpError;
use serde_json::Value;
use tracing::error;

/// Content type stamped on messages produced by [`JsonCodec`]
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Pluggable payload codec applied to every published and consumed message.
pub trait PayloadCodec: Send + Sync {
    /// Encodes a payload value into the bytes placed on the wire.
    fn serialize(&self, payload: &Value) -> Result<Vec<u8>, AmqpError>;

    /// Decodes wire bytes back into a payload value.
    fn deserialize(&self, raw: &[u8]) -> Result<Value, AmqpError>;

    /// Content type advertised in the message properties.
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }
}

/// Default JSON codec.
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn serialize(&self, payload: &Value) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "error serializing payload");
            AmqpError::SerializePayloadError
        })
    }

    fn deserialize(&self, raw: &[u8]) -> Result<Value, AmqpError> {
        serde_json::from_slice(raw).map_err(|_| AmqpError::ParsePayloadError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let payload = json!({ "id": 42, "tags": ["a", "b"] });

        let raw = codec.serialize(&payload).unwrap();
        assert_eq!(codec.deserialize(&raw).unwrap(), payload);
    }

    #[test]
    fn json_codec_rejects_non_json_bytes() {
        let codec = JsonCodec;
        assert_eq!(
            codec.deserialize(b"\xff\xfenot json"),
            Err(AmqpError::ParsePayloadError)
        );
    }
}
