//! Message envelopes and the type registry used to decode them.

use std::time::SystemTime;

use registry_core::NodeIdentifier;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::BusError;

/// A self-describing envelope carried on every channel. `payload` is kept as
/// a JSON value so the bus never has to know about concrete message types;
/// typed access goes through [`MessageEnvelope::decode`] /
/// [`MessageEnvelope::payload_as_value`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub sender_id: Option<NodeIdentifier>,
    pub payload: serde_json::Value,
    pub timestamp: SystemTime,
    pub correlation_id: Option<String>,
}

impl MessageEnvelope {
    pub fn new(type_tag: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            sender_id: None,
            payload,
            timestamp: SystemTime::now(),
            correlation_id: None,
        }
    }

    pub fn with_sender(mut self, sender_id: NodeIdentifier) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Decode the payload into a strongly-typed value, ignoring unknown
    /// fields. Decoding failures are local — never fatal — and are reported
    /// through [`BusError::PayloadDecode`] so the caller can fall back to the
    /// tolerant tree.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BusError::PayloadDecode(e.to_string()))
    }

    /// The schema-tolerant fallback: an unstructured JSON tree.
    pub fn payload_as_value(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(|e| BusError::PayloadDecode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::PayloadDecode(e.to_string()))
    }
}

/// Tracks which type tags the process knows how to construct responses for.
/// Registration is informational — it drives console listings and rejects
/// ambiguous `decode` calls for tags nothing advertised — decoding itself
/// stays generic over `T`, there is no runtime reflection.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    known_tags: std::collections::HashSet<String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_tag: impl Into<String>) {
        self.known_tags.insert(type_tag.into());
    }

    pub fn is_known(&self, type_tag: &str) -> bool {
        self.known_tags.contains(type_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        count: u32,
    }

    #[test]
    fn decodes_typed_payload_ignoring_unknown_fields() {
        let envelope = MessageEnvelope::new(
            "Ping",
            serde_json::json!({"count": 3, "extra": "ignored"}),
        );
        let ping: Ping = envelope.decode().unwrap();
        assert_eq!(ping, Ping { count: 3 });
    }

    #[test]
    fn falls_back_to_tolerant_tree_on_mismatch() {
        let envelope = MessageEnvelope::new("Ping", serde_json::json!({"unexpected": true}));
        let result: Result<Ping, BusError> = envelope.decode();
        assert!(result.is_err());
        assert!(envelope.payload_as_value().get("unexpected").is_some());
    }

    #[test]
    fn round_trips_through_bytes() {
        let envelope = MessageEnvelope::new("Ping", serde_json::json!({"count": 1}))
            .with_correlation_id("abc");
        let bytes = envelope.to_bytes().unwrap();
        let decoded = MessageEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.type_tag, "Ping");
        assert_eq!(decoded.correlation_id.as_deref(), Some("abc"));
    }
}
