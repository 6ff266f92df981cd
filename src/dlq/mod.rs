//! Dead-letter records.
//!
//! A message is dead-lettered when processing can never succeed (malformed
//! envelope, payload schema mismatch) or when its redeliveries are
//! exhausted. Transports persist the [`DeadLetter`] in a durable holding
//! queue; it is never redelivered to handlers.
//!
//! ## Queue Naming
//!
//! One DLQ per consuming service: `{topic_prefix}-{service_name}-dlq`.

use std::collections::HashMap;
use std::fmt;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::Delivery;
use crate::envelope::EventEnvelope;

/// Suffix appended to a service queue name to form its DLQ name.
pub const DLQ_SUFFIX: &str = "dlq";

/// Build the DLQ name for a service queue.
pub fn dlq_name_for_queue(queue: &str) -> String {
    format!("{}-{}", queue, DLQ_SUFFIX)
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The wire envelope could not be decoded at all.
    Malformed,
    /// A handler could not decode the payload into its event schema.
    PayloadDecode,
    /// Handlers kept failing past the retry threshold.
    RetriesExhausted,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Malformed => "malformed",
            Self::PayloadDecode => "payload_decode",
            Self::RetriesExhausted => "retries_exhausted",
        };
        f.write_str(s)
    }
}

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Broker message id of the original delivery.
    pub message_id: String,
    /// Envelope id, if the envelope decoded.
    pub envelope_id: Option<String>,
    /// Event type, if the envelope decoded.
    pub event_type_name: Option<String>,
    pub reason: DeadLetterReason,
    /// Human-readable failure description.
    pub error: String,
    /// Delivery attempts made, including the last one.
    pub attempts: u32,
    /// Queue the message was consumed from.
    pub source_queue: String,
    pub dead_lettered_at: DateTime<Utc>,
    /// Original wire body, base64 encoded so non-UTF-8 garbage survives.
    pub body_base64: String,
    /// Additional context (failed bindings, transport details).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeadLetter {
    /// Dead letter for a body that is not a valid envelope.
    pub fn malformed(delivery: &Delivery, source_queue: &str, error: impl Into<String>) -> Self {
        Self::build(delivery, None, source_queue, DeadLetterReason::Malformed, error.into())
    }

    /// Dead letter for a decoded envelope that can't or won't be processed.
    pub fn for_envelope(
        delivery: &Delivery,
        envelope: &EventEnvelope,
        source_queue: &str,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        Self::build(delivery, Some(envelope), source_queue, reason, error.into())
    }

    fn build(
        delivery: &Delivery,
        envelope: Option<&EventEnvelope>,
        source_queue: &str,
        reason: DeadLetterReason,
        error: String,
    ) -> Self {
        Self {
            message_id: delivery.message_id.clone(),
            envelope_id: envelope.map(|e| e.id().to_string()),
            event_type_name: envelope.map(|e| e.event_type_name().to_string()),
            reason,
            error,
            attempts: delivery.receive_count,
            source_queue: source_queue.to_string(),
            dead_lettered_at: Utc::now(),
            body_base64: BASE64_STANDARD.encode(&delivery.body),
            metadata: HashMap::new(),
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Original message body.
    pub fn body(&self) -> Vec<u8> {
        BASE64_STANDARD.decode(&self.body_base64).unwrap_or_default()
    }

    /// Serialize for storage in a broker DLQ.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
