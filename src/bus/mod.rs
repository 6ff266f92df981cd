//! Integration event bus.
//!
//! This module contains:
//! - `IntegrationEventBus`: the publish/subscribe façade applications use
//! - `Transport` trait: broker-specific provisioning, send and receive
//! - `Dispatcher`: registry lookup + handler invocation per message
//! - The receive loop driving ack/retry/dead-letter decisions
//! - Implementations: in-memory channel broker, AWS SNS/SQS

use std::time::Duration;

use async_trait::async_trait;

use crate::dlq::DeadLetter;
use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::registry::RegistryError;

pub mod channel;
pub mod consumer;
pub mod dispatch;
pub mod event_bus;
pub mod faulty;
#[cfg(feature = "sns-sqs")]
pub mod sns_sqs;

pub use channel::{ChannelBroker, ChannelConfig, ChannelTransport};
pub use consumer::{ConsumerConfig, ConsumerHandle, MessageState};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use event_bus::IntegrationEventBus;
pub use faulty::{FaultyTransport, FaultPlan};
#[cfg(feature = "sns-sqs")]
pub use sns_sqs::{SnsSqsConfig, SnsSqsTransport};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the bus and its transports.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    DuplicateBinding(#[from] RegistryError),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Topic not found for event type '{0}'")]
    TopicNotFound(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Bus is shutting down")]
    ShutdownInProgress,

    #[error("Bus already started")]
    AlreadyStarted,

    #[error("Invalid event type '{name}': {reason}")]
    InvalidEventType { name: String, reason: &'static str },

    #[error("Envelope error: {0}")]
    Envelope(EnvelopeError),
}

impl BusError {
    /// Whether retrying the same operation later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }
}

impl From<EnvelopeError> for BusError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::InvalidEventType { name, reason } => {
                Self::InvalidEventType { name, reason }
            }
            other => Self::Envelope(other),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One message pulled from the consuming service's queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub message_id: String,
    /// Handle used to ack, retry or dead-letter this receipt.
    pub receipt: String,
    /// Raw wire envelope.
    pub body: Vec<u8>,
    /// How many times the broker has handed this message out, starting at 1.
    pub receive_count: u32,
}

impl Delivery {
    /// Redeliveries so far (0 on first delivery).
    pub fn retries(&self) -> u32 {
        self.receive_count.saturating_sub(1)
    }
}

/// Broker adapter.
///
/// One topic per event type; one queue per consuming service bound to every
/// topic the service listens on; one dead-letter queue per service. All
/// provisioning calls are idempotent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// This service's queue, recorded as the source of dead letters.
    fn queue_name(&self) -> &str;

    /// Create the topic if needed and bind this service's queue to it.
    async fn ensure_listening(&self, event_type_name: &str) -> Result<()>;

    /// Unbind this service's queue from the event type's topic.
    async fn stop_listening(&self, event_type_name: &str) -> Result<()>;

    /// Publish an envelope to its event type's topic.
    ///
    /// Returns once the broker accepted the message.
    async fn send(&self, envelope: &EventEnvelope) -> Result<()>;

    /// Pull up to `max_messages` from this service's queue, waiting up to the
    /// transport's poll interval. An empty batch is not an error.
    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>>;

    /// Delete a processed message.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a message to the queue, visible again after `delay`.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Move a message to the dead-letter queue and delete the original.
    async fn dead_letter(&self, delivery: &Delivery, dead_letter: DeadLetter) -> Result<()>;

    /// Called once when the bus stops. Releases topic subscriptions only
    /// when configured to; the queue is shared by every replica.
    async fn shutdown(&self) -> Result<()>;
}
