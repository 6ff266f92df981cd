//! Integration event envelope.
//!
//! An envelope is the wire-level wrapper around one event occurrence. The
//! `event_type_name` is the routing key: topics, subscriptions and handler
//! lookup all key on it, never on a Rust type name.
//!
//! Wire format (JSON):
//! ```text
//! {"id":"<string>","eventTypeName":"OrderStarted","createdAt":"<RFC 3339>","payload":{...}}
//! ```
//!
//! Ids minted here are UUID v4 strings, but any non-empty string from a
//! foreign producer is accepted.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of an event type name (SNS topic name limit).
pub const MAX_EVENT_TYPE_NAME_LEN: usize = 256;

/// Errors building, encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid event type name '{name}': {reason}")]
    InvalidEventType { name: String, reason: &'static str },

    #[error("Failed to serialize event payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Malformed envelope: empty id")]
    MissingId,
}

/// An event that can be published on the bus.
///
/// `EVENT_TYPE_NAME` must be stable across releases and services; it is the
/// contract consumers subscribe to.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE_NAME: &'static str;

    fn event_type_name(&self) -> &'static str {
        Self::EVENT_TYPE_NAME
    }
}

/// Check that an event type name can be used as a routing key.
///
/// Accepts ASCII alphanumerics, `-`, `_` and `.`.
pub fn validate_event_type_name(name: &str) -> Result<(), EnvelopeError> {
    let invalid = |reason| EnvelopeError::InvalidEventType {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_EVENT_TYPE_NAME_LEN {
        return Err(invalid("longer than 256 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only ASCII alphanumerics, '-', '_' and '.' are allowed"));
    }
    Ok(())
}

/// Immutable record of one integration event occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    id: String,
    event_type_name: String,
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap a typed event, assigning a fresh id and timestamp.
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(event).map_err(EnvelopeError::Serialize)?;
        Self::new(event.event_type_name(), payload)
    }

    /// Build an envelope around an already-serialized payload.
    pub fn new(
        event_type_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Self, EnvelopeError> {
        let event_type_name = event_type_name.into();
        validate_event_type_name(&event_type_name)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            event_type_name,
            created_at: Utc::now(),
            payload,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type_name(&self) -> &str {
        &self.event_type_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserialize the payload into a concrete event shape.
    pub fn decode_payload<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }

    /// Encode to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Serialize)
    }

    /// Decode from the JSON wire format.
    ///
    /// Rejects envelopes whose `eventTypeName` would not have been accepted
    /// at publish time.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)?;
        if envelope.id.is_empty() {
            return Err(EnvelopeError::MissingId);
        }
        validate_event_type_name(&envelope.event_type_name)?;
        Ok(envelope)
    }
}
