//! Integration Event Bus
//!
//! Publish/subscribe of integration events between services over broker
//! topics and queues, with bounded retries and dead-lettering.
//!
//! Applications define event types implementing [`IntegrationEvent`], write
//! handlers implementing [`IntegrationEventHandler`], register them with a
//! [`HandlerResolver`] under a binding id, and subscribe the binding id on an
//! [`IntegrationEventBus`].

pub mod bus;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod handlers;
pub mod registry;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use bus::{BusError, DispatchOutcome, IntegrationEventBus, Transport};
pub use envelope::{EventEnvelope, IntegrationEvent};
pub use handlers::{HandlerContainer, HandlerResolver, IntegrationEventHandler};
pub use registry::{HandlerBindingId, SubscriptionRegistry};
