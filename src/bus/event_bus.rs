//! Publish/subscribe façade.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::consumer::{ConsumerConfig, ConsumerHandle};
use super::dispatch::{DispatchOutcome, Dispatcher};
use super::{BusError, Result, Transport};
use crate::envelope::{validate_event_type_name, EventEnvelope, IntegrationEvent};
use crate::handlers::{HandlerInvoker, HandlerResolver};
use crate::registry::{HandlerBindingId, SubscriptionRegistry};
use crate::utils::retry::publish_backoff;

/// Default upper bound for a publish, transport retries included.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

enum Lifecycle {
    Idle,
    Running(ConsumerHandle),
    Stopped,
}

/// Integration event bus for one consuming service.
///
/// Owns its [`SubscriptionRegistry`]; independent instances never share
/// subscriptions. Handlers are resolved per message through the
/// [`HandlerResolver`] supplied at construction.
pub struct IntegrationEventBus {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    consumer_config: ConsumerConfig,
    publish_timeout: Duration,
    lifecycle: RwLock<Lifecycle>,
    stopping: AtomicBool,
    /// Event types this service's queue is bound to. Held across registry and
    /// transport calls so subscribe and reconcile never interleave.
    listening: Mutex<BTreeSet<String>>,
}

impl IntegrationEventBus {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn HandlerResolver>,
        consumer_config: ConsumerConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::new(SubscriptionRegistry::new()),
            HandlerInvoker::new(resolver),
        );
        Self {
            transport,
            dispatcher: Arc::new(dispatcher),
            consumer_config,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            lifecycle: RwLock::new(Lifecycle::Idle),
            stopping: AtomicBool::new(false),
            listening: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.dispatcher.registry()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether the receive loop is running.
    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.read().await, Lifecycle::Running(_))
    }

    fn ensure_not_stopping(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(BusError::ShutdownInProgress);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Publish an event and return its envelope id once the broker accepted it.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_type = %event.event_type_name()))]
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<String> {
        let envelope = EventEnvelope::from_event(event)?;
        self.publish_envelope(&envelope).await?;
        Ok(envelope.id().to_string())
    }

    /// Publish a pre-built envelope.
    ///
    /// Transient transport failures are retried with backoff until the
    /// publish timeout elapses.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<()> {
        self.ensure_not_stopping()?;
        let lifecycle = self.lifecycle.read().await;
        if matches!(*lifecycle, Lifecycle::Stopped) {
            return Err(BusError::ShutdownInProgress);
        }

        let send = (|| async { self.transport.send(envelope).await })
            .retry(publish_backoff())
            .when(BusError::is_transient)
            .notify(|err: &BusError, dur: Duration| {
                warn!(
                    event_type = %envelope.event_type_name(),
                    error = %err,
                    delay = ?dur,
                    "Publish failed, retrying"
                );
            });

        match tokio::time::timeout(self.publish_timeout, send).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BusError::TransportUnavailable(format!(
                    "publish of '{}' timed out after {:?}",
                    envelope.event_type_name(),
                    self.publish_timeout
                )));
            }
        }
        drop(lifecycle);

        debug!(
            event_type = %envelope.event_type_name(),
            envelope_id = %envelope.id(),
            "Envelope published"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Bind `binding_id` to event type `E` and start listening on its topic.
    pub async fn subscribe<E: IntegrationEvent>(
        &self,
        binding_id: impl Into<HandlerBindingId>,
    ) -> Result<()> {
        self.subscribe_to(E::EVENT_TYPE_NAME, binding_id).await
    }

    /// Bind `binding_id` to an event type by name.
    ///
    /// Idempotent for an identical pair. If the transport cannot provision
    /// the topic binding, a newly added registry entry is rolled back.
    pub async fn subscribe_to(
        &self,
        event_type_name: &str,
        binding_id: impl Into<HandlerBindingId>,
    ) -> Result<()> {
        self.ensure_not_stopping()?;
        validate_event_type_name(event_type_name)?;
        let binding_id = binding_id.into();
        let mut listening = self.listening.lock().await;

        let added = self
            .registry()
            .subscribe(event_type_name, binding_id.clone())
            .await?;

        if let Err(e) = self.transport.ensure_listening(event_type_name).await {
            if added {
                self.registry().unsubscribe(event_type_name, &binding_id).await;
            }
            return Err(e);
        }
        listening.insert(event_type_name.to_string());
        drop(listening);

        if added {
            info!(
                event_type = %event_type_name,
                binding_id = %binding_id,
                "Subscribed"
            );
        }
        Ok(())
    }

    /// Remove a binding. The service keeps listening on the topic; messages
    /// with no remaining bindings are acknowledged without dispatch.
    pub async fn unsubscribe(
        &self,
        event_type_name: &str,
        binding_id: impl Into<HandlerBindingId>,
    ) -> bool {
        let binding_id = binding_id.into();
        let removed = self.registry().unsubscribe(event_type_name, &binding_id).await;
        if removed {
            info!(
                event_type = %event_type_name,
                binding_id = %binding_id,
                "Unsubscribed"
            );
        }
        removed
    }

    /// Stop listening on topics whose event types lost all their bindings.
    ///
    /// Returns the event types released.
    pub async fn reconcile_listeners(&self) -> Result<Vec<String>> {
        let mut listening = self.listening.lock().await;
        let mut released = Vec::new();
        for event_type in listening.iter() {
            if self.registry().has_bindings(event_type).await {
                continue;
            }
            self.transport.stop_listening(event_type).await?;
            released.push(event_type.clone());
        }
        for event_type in &released {
            listening.remove(event_type);
        }

        if !released.is_empty() {
            info!(released = ?released, "Released unused listeners");
        }
        Ok(released)
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    /// Run every handler bound to the envelope's event type.
    pub async fn process_message(&self, envelope: Arc<EventEnvelope>) -> DispatchOutcome {
        self.dispatcher.process_message(envelope).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Provision listeners for every subscribed event type and start the
    /// receive loop.
    ///
    /// Fails fast if provisioning fails; the bus stays idle and `start` may
    /// be called again.
    pub async fn start(&self) -> Result<()> {
        self.ensure_not_stopping()?;
        let mut lifecycle = self.lifecycle.write().await;
        match *lifecycle {
            Lifecycle::Running(_) => return Err(BusError::AlreadyStarted),
            Lifecycle::Stopped => return Err(BusError::ShutdownInProgress),
            Lifecycle::Idle => {}
        }

        let event_types = self.registry().subscribed_event_types().await;
        for event_type in &event_types {
            self.transport.ensure_listening(event_type).await?;
        }
        self.listening.lock().await.extend(event_types.iter().cloned());

        let handle = ConsumerHandle::spawn(
            Arc::clone(&self.transport),
            Arc::clone(&self.dispatcher),
            self.consumer_config.clone(),
        );
        *lifecycle = Lifecycle::Running(handle);

        info!(
            transport = self.transport.name(),
            queue = %self.transport.queue_name(),
            event_types = event_types.len(),
            "Event bus started"
        );
        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// New publishes fail with `ShutdownInProgress`; in-flight publishes and
    /// in-flight message dispatches complete first. Listeners are released and
    /// the registry is cleared. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let mut lifecycle = self.lifecycle.write().await;

        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
        match previous {
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Running(handle) => handle.shutdown().await,
            Lifecycle::Idle => {}
        }

        let result = self.transport.shutdown().await;
        self.registry().clear().await;
        self.listening.lock().await.clear();

        info!(queue = %self.transport.queue_name(), "Event bus stopped");
        result
    }
}
