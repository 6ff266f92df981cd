//! Handler seams.
//!
//! Application code implements [`IntegrationEventHandler`] for a concrete
//! event type. The bus only ever sees the type-erased [`EnvelopeHandler`],
//! obtained from a [`HandlerResolver`] by binding id at dispatch time.

pub mod invoker;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use crate::envelope::{EventEnvelope, IntegrationEvent};
use crate::registry::HandlerBindingId;

pub use invoker::{HandlerInvoker, InvokeError};

/// Error returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Typed handler for one integration event type.
///
/// Delivery is at-least-once: a handler may see the same envelope id more
/// than once and must tolerate it.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    async fn handle(&self, event: E, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Why a type-erased handler did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerFailure {
    /// The payload does not match the handler's event schema.
    PayloadDecode(String),
    /// The handler ran and failed.
    Execution(String),
}

/// Type-erased handler the invoker executes.
pub trait EnvelopeHandler: Send + Sync {
    /// Event type this handler processes.
    fn event_type_name(&self) -> &str;

    fn handle(&self, envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), HandlerFailure>>;
}

/// Adapts an [`IntegrationEventHandler`] to [`EnvelopeHandler`] by decoding
/// the payload into `E` first.
pub struct TypedHandler<E, H> {
    inner: Arc<H>,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + 'static,
{
    pub fn new(handler: H) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    pub fn from_arc(handler: Arc<H>) -> Self {
        Self {
            inner: handler,
            _event: PhantomData,
        }
    }
}

impl<E, H> EnvelopeHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + 'static,
{
    fn event_type_name(&self) -> &str {
        E::EVENT_TYPE_NAME
    }

    fn handle(&self, envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), HandlerFailure>> {
        if envelope.event_type_name() != E::EVENT_TYPE_NAME {
            let failure = HandlerFailure::PayloadDecode(format!(
                "handler expects '{}' but envelope carries '{}'",
                E::EVENT_TYPE_NAME,
                envelope.event_type_name()
            ));
            return Box::pin(async move { Err(failure) });
        }

        let event: E = match envelope.decode_payload() {
            Ok(event) => event,
            Err(e) => {
                let failure = HandlerFailure::PayloadDecode(e.to_string());
                return Box::pin(async move { Err(failure) });
            }
        };

        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner
                .handle(event, &envelope)
                .await
                .map_err(|e| HandlerFailure::Execution(e.to_string()))
        })
    }
}

/// Dependency resolver: turns a binding id into a ready handler instance.
///
/// The bus never constructs handlers itself.
#[async_trait]
pub trait HandlerResolver: Send + Sync {
    async fn resolve(&self, binding_id: &HandlerBindingId) -> Option<Arc<dyn EnvelopeHandler>>;
}

type HandlerFactory = Box<dyn Fn() -> Arc<dyn EnvelopeHandler> + Send + Sync>;

/// In-memory [`HandlerResolver`] keyed by binding id.
///
/// Factories registered with [`register`](Self::register) build a fresh
/// handler per resolution; [`register_instance`](Self::register_instance)
/// shares one instance.
#[derive(Default)]
pub struct HandlerContainer {
    factories: RwLock<HashMap<HandlerBindingId, HandlerFactory>>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory producing a new handler per resolution.
    pub async fn register<E, H, F>(&self, binding_id: impl Into<HandlerBindingId>, factory: F)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let binding_id = binding_id.into();
        debug!(binding = %binding_id, event_type = E::EVENT_TYPE_NAME, "Registered handler factory");
        self.factories.write().await.insert(
            binding_id,
            Box::new(move || Arc::new(TypedHandler::<E, H>::new(factory())) as Arc<dyn EnvelopeHandler>),
        );
    }

    /// Register a shared handler instance.
    pub async fn register_instance<E, H>(&self, binding_id: impl Into<HandlerBindingId>, handler: Arc<H>)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        let handler: Arc<dyn EnvelopeHandler> = Arc::new(TypedHandler::<E, H>::from_arc(handler));
        self.register_envelope_handler(binding_id, handler).await;
    }

    /// Register an already type-erased handler.
    pub async fn register_envelope_handler(
        &self,
        binding_id: impl Into<HandlerBindingId>,
        handler: Arc<dyn EnvelopeHandler>,
    ) {
        let binding_id = binding_id.into();
        debug!(binding = %binding_id, event_type = %handler.event_type_name(), "Registered handler instance");
        self.factories
            .write()
            .await
            .insert(binding_id, Box::new(move || Arc::clone(&handler)));
    }

    /// Remove a registration. Returns `true` if one existed.
    pub async fn remove(&self, binding_id: &HandlerBindingId) -> bool {
        self.factories.write().await.remove(binding_id).is_some()
    }
}

#[async_trait]
impl HandlerResolver for HandlerContainer {
    async fn resolve(&self, binding_id: &HandlerBindingId) -> Option<Arc<dyn EnvelopeHandler>> {
        self.factories.read().await.get(binding_id).map(|factory| factory())
    }
}
