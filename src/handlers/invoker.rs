//! Handler invocation with failure isolation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use super::{HandlerFailure, HandlerResolver};
use crate::envelope::EventEnvelope;
use crate::registry::HandlerBindingId;

/// Outcome of invoking one handler binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error("No handler resolved for binding '{binding_id}'")]
    NotResolved { binding_id: HandlerBindingId },

    #[error("Handler '{binding_id}' could not decode '{event_type}' payload: {message}")]
    PayloadDecode {
        binding_id: HandlerBindingId,
        event_type: String,
        message: String,
    },

    #[error("Handler '{binding_id}' failed: {message}")]
    HandlerExecution {
        binding_id: HandlerBindingId,
        message: String,
    },
}

impl InvokeError {
    /// A redelivery might succeed.
    ///
    /// Schema mismatches never heal, everything else is worth another try.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PayloadDecode { .. })
    }

    pub fn binding_id(&self) -> &HandlerBindingId {
        match self {
            Self::NotResolved { binding_id }
            | Self::PayloadDecode { binding_id, .. }
            | Self::HandlerExecution { binding_id, .. } => binding_id,
        }
    }
}

/// Resolves and runs handlers, converting every failure (panics included)
/// into an [`InvokeError`].
#[derive(Clone)]
pub struct HandlerInvoker {
    resolver: Arc<dyn HandlerResolver>,
}

impl HandlerInvoker {
    pub fn new(resolver: Arc<dyn HandlerResolver>) -> Self {
        Self { resolver }
    }

    pub async fn invoke(
        &self,
        binding_id: &HandlerBindingId,
        envelope: Arc<EventEnvelope>,
    ) -> Result<(), InvokeError> {
        let Some(handler) = self.resolver.resolve(binding_id).await else {
            warn!(binding = %binding_id, "No handler registered for binding");
            return Err(InvokeError::NotResolved {
                binding_id: binding_id.clone(),
            });
        };

        let event_type = envelope.event_type_name().to_string();
        let run = AssertUnwindSafe(async move { handler.handle(envelope).await });

        match run.catch_unwind().await {
            Ok(Ok(())) => {
                debug!(binding = %binding_id, event_type = %event_type, "Handler completed");
                Ok(())
            }
            Ok(Err(HandlerFailure::PayloadDecode(message))) => Err(InvokeError::PayloadDecode {
                binding_id: binding_id.clone(),
                event_type,
                message,
            }),
            Ok(Err(HandlerFailure::Execution(message))) => Err(InvokeError::HandlerExecution {
                binding_id: binding_id.clone(),
                message,
            }),
            Err(panic) => Err(InvokeError::HandlerExecution {
                binding_id: binding_id.clone(),
                message: format!("handler panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
