// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codec
//!
//! Pluggable byte/object conversion, selected once at process configuration
//! time. The trait is object-safe by routing through [`serde_json::Value`] as
//! the interchange representation, so a codec only deals with bytes on one side
//! and a self-describing tree on the other.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Byte-level payload codec.
#[cfg_attr(test, mockall::automock)]
pub trait Codec: Send + Sync {
    /// MIME content type stamped on published messages.
    fn content_type(&self) -> &'static str;

    /// Encodes a value tree into wire bytes.
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, AmqpError>;

    /// Decodes wire bytes into a value tree.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, AmqpError>;
}

/// JSON codec, the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|e| AmqpError::SerializeError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, AmqpError> {
        serde_json::from_slice(bytes).map_err(|e| AmqpError::DeserializeError(e.to_string()))
    }
}

/// Serializes a typed payload through the codec.
pub fn encode_payload<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<Vec<u8>, AmqpError> {
    let tree = serde_json::to_value(value).map_err(|e| AmqpError::SerializeError(e.to_string()))?;
    codec.encode(&tree)
}

/// Deserializes a typed payload through the codec.
pub fn decode_payload<T: DeserializeOwned>(
    codec: &dyn Codec,
    bytes: &[u8],
) -> Result<T, AmqpError> {
    let tree = codec.decode(bytes)?;
    serde_json::from_value(tree).map_err(|e| AmqpError::DeserializeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: u32,
        name: String,
    }

    #[test]
    fn json_round_trip() {
        let codec = JsonCodec;
        let value = Sample {
            id: 7,
            name: "seven".to_owned(),
        };

        let bytes = encode_payload(&codec, &value).unwrap();
        let back: Sample = decode_payload(&codec, &bytes).unwrap();

        assert_eq!(back, value);
    }

    #[test]
    fn encode_payload_routes_through_the_codec() {
        let mut codec = MockCodec::new();
        codec
            .expect_encode()
            .times(1)
            .returning(|_| Ok(b"encoded".to_vec()));

        let value = Sample {
            id: 1,
            name: "one".to_owned(),
        };

        assert_eq!(encode_payload(&codec, &value).unwrap(), b"encoded");
    }

    #[test]
    fn decode_reports_malformed_payload() {
        let codec = JsonCodec;
        let err = decode_payload::<Sample>(&codec, b"not json").unwrap_err();
        assert!(matches!(err, AmqpError::DeserializeError(_)));
    }

    #[test]
    fn decode_reports_shape_mismatch() {
        let codec = JsonCodec;
        let err = decode_payload::<Sample>(&codec, b"{\"other\":true}").unwrap_err();
        assert!(matches!(err, AmqpError::DeserializeError(_)));
    }
}
