//! Message packets and the pluggable payload codec.
//!
//! A [`Packet`] is the unit client code publishes and subscribers receive.
//! Routing metadata (`kind`, `token`, `from`, ...) is optional: packets
//! without it still travel, they just yield a republish context with nulls.
//! The wire representation is owned by a [`PacketSerializer`]; the JSON
//! implementation backed by serde_json is the default.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The unit of publication and delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// Packet type name, matched against subscription filters
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Originating endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Correlation token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Whether no response is expected
    #[serde(default = "default_one_way")]
    pub one_way: bool,
    /// Prior delivery attempts; non-empty marks a re-send
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tries: Vec<String>,
    /// Application payload
    #[serde(default)]
    pub payload: Value,
}

fn default_one_way() -> bool {
    true
}

impl Packet {
    /// A packet carrying only a type and payload
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            from: None,
            token: None,
            one_way: true,
            tries: Vec::new(),
            payload,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_one_way(mut self, one_way: bool) -> Self {
        self.one_way = one_way;
        self
    }

    /// Raw bytes used when publishing without a serializer: string payloads
    /// go out verbatim, anything else as its JSON rendering.
    pub fn raw_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        match &self.payload {
            Value::String(s) => Ok(s.clone().into_bytes()),
            value => serde_json::to_vec(value).map_err(SerializeError::Encode),
        }
    }
}

/// Codec failures
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Pluggable payload codec; the HA client only needs encode and decode
pub trait PacketSerializer: Send + Sync {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, SerializeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Packet, SerializeError>;
}

/// JSON codec used unless the caller supplies another serializer
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl PacketSerializer for JsonSerializer {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(packet).map_err(SerializeError::Encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet, SerializeError> {
        serde_json::from_slice(bytes).map_err(SerializeError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let packet = Packet::new("Request", json!({"method": "list"}))
            .with_token("token-1")
            .with_from("node-7")
            .with_one_way(false);

        let serializer = JsonSerializer;
        let bytes = serializer.encode(&packet).unwrap();
        let decoded = serializer.decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_kind_serializes_as_type() {
        let packet = Packet::new("Push", Value::Null);
        let bytes = JsonSerializer.encode(&packet).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "Push");
    }

    #[test]
    fn test_one_way_defaults_true_on_decode() {
        let decoded = JsonSerializer.decode(br#"{"type":"Push"}"#).unwrap();
        assert!(decoded.one_way);
        assert!(decoded.token.is_none());
    }

    #[test]
    fn test_decode_failure() {
        let result = JsonSerializer.decode(b"\x00\x01 not json");
        assert!(matches!(result, Err(SerializeError::Decode(_))));
    }

    #[test]
    fn test_raw_bytes_string_payload_verbatim() {
        let packet = Packet::new("Push", Value::String("plain text".to_string()));
        assert_eq!(packet.raw_bytes().unwrap(), b"plain text".to_vec());
    }

    #[test]
    fn test_raw_bytes_structured_payload_as_json() {
        let packet = Packet::new("Push", json!({"a": 1}));
        assert_eq!(packet.raw_bytes().unwrap(), br#"{"a":1}"#.to_vec());
    }
}
