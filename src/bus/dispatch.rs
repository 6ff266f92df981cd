//! Message dispatch.
//!
//! Looks up the bindings for an envelope's event type and runs every bound
//! handler, aggregating per-handler outcomes into one message outcome.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, warn};

use crate::envelope::EventEnvelope;
use crate::handlers::{HandlerInvoker, InvokeError};
use crate::registry::SubscriptionRegistry;

/// Result of processing one envelope through its handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every bound handler succeeded. `handled` is 0 when the event type has
    /// no bindings in this service.
    Success { handled: usize },
    /// At least one handler failed in a way a redelivery might fix.
    HandlerFailed { failures: Vec<InvokeError> },
    /// At least one handler could not decode the payload; retrying won't help.
    DecodeError { failures: Vec<InvokeError> },
}

impl DispatchOutcome {
    /// Returns true if all handlers succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failures(&self) -> &[InvokeError] {
        match self {
            Self::Success { .. } => &[],
            Self::HandlerFailed { failures } | Self::DecodeError { failures } => failures,
        }
    }

    /// One-line summary of the failures for logs and dead letters.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn from_results(handled: usize, results: Vec<Result<(), InvokeError>>) -> Self {
        let failures: Vec<InvokeError> = results.into_iter().filter_map(|r| r.err()).collect();

        if failures.is_empty() {
            Self::Success { handled }
        } else if failures.iter().any(|f| !f.is_retryable()) {
            Self::DecodeError { failures }
        } else {
            Self::HandlerFailed { failures }
        }
    }
}

/// Registry + invoker pair shared by the bus façade and the receive loop.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    invoker: HandlerInvoker,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, invoker: HandlerInvoker) -> Self {
        Self { registry, invoker }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Run every handler bound to the envelope's event type.
    ///
    /// Handlers start in subscription order and run concurrently; one
    /// handler's failure never stops its siblings.
    pub async fn process_message(&self, envelope: Arc<EventEnvelope>) -> DispatchOutcome {
        let event_type = envelope.event_type_name();
        let bindings = self.registry.bindings(event_type).await;

        if bindings.is_empty() {
            debug!(
                event_type = %event_type,
                envelope_id = %envelope.id(),
                "No bindings for event type"
            );
            return DispatchOutcome::Success { handled: 0 };
        }

        let invocations = bindings
            .iter()
            .map(|binding_id| self.invoker.invoke(binding_id, Arc::clone(&envelope)));
        let results = join_all(invocations).await;

        let outcome = DispatchOutcome::from_results(bindings.len(), results);
        match &outcome {
            DispatchOutcome::Success { handled } => {
                debug!(
                    event_type = %event_type,
                    envelope_id = %envelope.id(),
                    handled = handled,
                    "Envelope dispatched"
                );
            }
            DispatchOutcome::HandlerFailed { failures } => {
                for failure in failures {
                    warn!(
                        event_type = %event_type,
                        envelope_id = %envelope.id(),
                        error = %failure,
                        "Handler failed"
                    );
                }
            }
            DispatchOutcome::DecodeError { failures } => {
                for failure in failures {
                    error!(
                        event_type = %event_type,
                        envelope_id = %envelope.id(),
                        error = %failure,
                        "Handler failed"
                    );
                }
            }
        }
        outcome
    }
}
