//! Pluggable payload codecs
//!
//! Events travel inside an [`EventMessage`] whose payload is itself an encoded
//! [`Event`]. Both layers go through the same codec, chosen at startup from
//! [`CodecKind`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::event::{Event, EventMessage};

/// Serializer/deserializer for events and wire envelopes.
///
/// Implementations must be deterministic and must consume exactly the bytes
/// they are given.
pub trait SerializerDeserializer: Send + Sync {
    /// Encode an event
    fn encode_event(&self, event: &Event) -> Result<Vec<u8>, CodecError>;

    /// Decode an event
    fn decode_event(&self, bytes: &[u8]) -> Result<Event, CodecError>;

    /// Encode a wire envelope
    fn encode_message(&self, message: &EventMessage) -> Result<Vec<u8>, CodecError>;

    /// Decode a wire envelope
    fn decode_message(&self, bytes: &[u8]) -> Result<EventMessage, CodecError>;
}

/// Codec selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Compact binary encoding
    #[default]
    Bincode,
    /// JSON, for debugging and interop
    Json,
}

/// Build the codec registered for `kind`
pub fn from_kind(kind: CodecKind) -> Arc<dyn SerializerDeserializer> {
    match kind {
        CodecKind::Bincode => Arc::new(BincodeCodec),
        CodecKind::Json => Arc::new(JsonCodec),
    }
}

/// bincode with the standard configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        let (value, consumed) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CodecError::Decode(e.to_string()))?;
        if consumed != bytes.len() {
            return Err(CodecError::Decode(format!(
                "{} trailing bytes",
                bytes.len() - consumed
            )));
        }
        Ok(value)
    }
}

impl SerializerDeserializer for BincodeCodec {
    fn encode_event(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        Self::encode(event)
    }

    fn decode_event(&self, bytes: &[u8]) -> Result<Event, CodecError> {
        Self::decode(bytes)
    }

    fn encode_message(&self, message: &EventMessage) -> Result<Vec<u8>, CodecError> {
        Self::encode(message)
    }

    fn decode_message(&self, bytes: &[u8]) -> Result<EventMessage, CodecError> {
        Self::decode(bytes)
    }
}

/// serde_json encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl SerializerDeserializer for JsonCodec {
    fn encode_event(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_event(&self, bytes: &[u8]) -> Result<Event, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_message(&self, message: &EventMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_message(&self, bytes: &[u8]) -> Result<EventMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event::builder("doobie")
            .field("word", "doobie")
            .field("count", 1i64)
            .field("weight", 0.5f64)
            .build()
    }

    #[test]
    fn test_each_kind_decodes_its_own_output() {
        for kind in [CodecKind::Bincode, CodecKind::Json] {
            let codec = from_kind(kind);
            let bytes = codec.encode_event(&sample()).unwrap();
            assert_eq!(codec.decode_event(&bytes).unwrap(), sample());

            let message = EventMessage::new(3, "words", bytes);
            let wire = codec.encode_message(&message).unwrap();
            assert_eq!(codec.decode_message(&wire).unwrap(), message);
        }
    }

    #[test]
    fn test_bincode_rejects_trailing_bytes() {
        let codec = BincodeCodec;
        let mut bytes = codec.encode_event(&sample()).unwrap();
        bytes.push(0);
        assert!(matches!(
            codec.decode_event(&bytes),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_bincode_is_deterministic() {
        let codec = BincodeCodec;
        assert_eq!(
            codec.encode_event(&sample()).unwrap(),
            codec.encode_event(&sample()).unwrap()
        );
    }
}
