//! The four-field wire envelope used for every message in both directions
//! (spec §4.A, §6). Serialization is plain UTF-8 JSON; deserialization is
//! total — it never panics, it returns a descriptive error instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope kind must be present and non-empty")]
    EmptyKind,

    #[error("envelope timestamp must be a positive integer")]
    InvalidTimestamp,

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Wire shape: `{"type": "...", "sessionId": "...", "data": ..., "timestamp": N}`.
///
/// `kind` is renamed to `type` on the wire to match §6's schema; `sessionId`
/// is camelCase on the wire per the same schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: i64,
}

impl MessageEnvelope {
    /// Construct and validate in one step — the only way to get an envelope
    /// that is guaranteed to serialize back to itself.
    pub fn new(
        kind: impl Into<String>,
        session_id: Option<String>,
        data: Option<Value>,
        timestamp: i64,
    ) -> Result<Self, EnvelopeError> {
        let envelope = Self {
            kind: kind.into(),
            session_id,
            data,
            timestamp,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.kind.is_empty() {
            return Err(EnvelopeError::EmptyKind);
        }
        if self.timestamp <= 0 {
            return Err(EnvelopeError::InvalidTimestamp);
        }
        Ok(())
    }

    /// Bit-exact textual serialization (§4.A round-trip law).
    pub fn serialize(&self) -> Result<String, EnvelopeError> {
        self.validate()?;
        serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Total deserialization: never panics, always returns a descriptive
    /// error on malformed input instead of throwing.
    pub fn deserialize(raw: &str) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_law() {
        let e = MessageEnvelope::new(
            "ping",
            Some("sess-1".to_string()),
            Some(json!({"timestamp": 42})),
            1000,
        )
        .unwrap();
        let wire = e.serialize().unwrap();
        let back = MessageEnvelope::deserialize(&wire).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn round_trip_without_session_id_or_data() {
        let e = MessageEnvelope::new("end_utterance", None, None, 5).unwrap();
        let wire = e.serialize().unwrap();
        let back = MessageEnvelope::deserialize(&wire).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn empty_kind_rejected() {
        let err = MessageEnvelope::new("", None, None, 1).unwrap_err();
        assert_eq!(err, EnvelopeError::EmptyKind);
    }

    #[test]
    fn non_positive_timestamp_rejected() {
        assert_eq!(
            MessageEnvelope::new("ping", None, None, 0).unwrap_err(),
            EnvelopeError::InvalidTimestamp
        );
        assert_eq!(
            MessageEnvelope::new("ping", None, None, -5).unwrap_err(),
            EnvelopeError::InvalidTimestamp
        );
    }

    #[test]
    fn malformed_json_is_descriptive_not_a_panic() {
        let err = MessageEnvelope::deserialize("not json at all").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn missing_kind_field_is_malformed() {
        let err = MessageEnvelope::deserialize(r#"{"timestamp": 1}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn data_accepted_as_any_shape() {
        let e = MessageEnvelope::new("response_end", None, Some(json!([1, 2, "x"])), 1).unwrap();
        let wire = e.serialize().unwrap();
        let back = MessageEnvelope::deserialize(&wire).unwrap();
        assert_eq!(e.data, back.data);
    }
}
