//! Fault-injecting transport wrapper for testing broker outages.
//!
//! Wraps any [`Transport`] and fails a configurable number of upcoming
//! calls with `TransportUnavailable`. Useful for exercising publish
//! retries, receive-loop backoff and fail-fast startup.
//!
//! # Example
//!
//! ```ignore
//! use integration_bus::bus::{ChannelBroker, ChannelConfig, FaultyTransport};
//!
//! let inner = ChannelBroker::new().transport("orders", ChannelConfig::default());
//! let faulty = FaultyTransport::new(inner);
//! let plan = faulty.plan();
//!
//! // The next two sends fail, the third reaches the broker.
//! plan.fail_next_sends(2);
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{BusError, Delivery, Result, Transport};
use crate::dlq::DeadLetter;
use crate::envelope::EventEnvelope;

/// Upcoming failures to inject, shared between the wrapper and the test.
#[derive(Debug, Default)]
pub struct FaultPlan {
    sends: AtomicU32,
    receives: AtomicU32,
    provisioning: AtomicU32,
    /// Calls that were failed on purpose.
    injected: AtomicU64,
    /// Calls forwarded to the inner transport.
    passed: AtomicU64,
}

impl FaultPlan {
    /// Fail the next `n` sends.
    pub fn fail_next_sends(&self, n: u32) {
        self.sends.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` receives.
    pub fn fail_next_receives(&self, n: u32) {
        self.receives.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` topic/queue provisioning calls.
    pub fn fail_next_provisioning(&self, n: u32) {
        self.provisioning.store(n, Ordering::SeqCst);
    }

    /// Get a snapshot of (injected, passed).
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.injected.load(Ordering::Relaxed),
            self.passed.load(Ordering::Relaxed),
        )
    }

    /// Consume one pending failure from `counter`, if any.
    fn trip(&self, counter: &AtomicU32, op: &'static str) -> Result<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            self.injected.fetch_add(1, Ordering::Relaxed);
            debug!(op, "Injected transport fault");
            return Err(BusError::TransportUnavailable(format!("injected {} fault", op)));
        }
        self.passed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Wrapper that fails calls according to its [`FaultPlan`].
///
/// With an empty plan this is a pure pass-through.
pub struct FaultyTransport<T: Transport> {
    inner: T,
    plan: Arc<FaultPlan>,
}

impl<T: Transport> FaultyTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            plan: Arc::new(FaultPlan::default()),
        }
    }

    /// Shared handle to the fault plan.
    pub fn plan(&self) -> Arc<FaultPlan> {
        Arc::clone(&self.plan)
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for FaultyTransport<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    async fn ensure_listening(&self, event_type_name: &str) -> Result<()> {
        self.plan.trip(&self.plan.provisioning, "provisioning")?;
        self.inner.ensure_listening(event_type_name).await
    }

    async fn stop_listening(&self, event_type_name: &str) -> Result<()> {
        self.inner.stop_listening(event_type_name).await
    }

    async fn send(&self, envelope: &EventEnvelope) -> Result<()> {
        self.plan.trip(&self.plan.sends, "send")?;
        self.inner.send(envelope).await
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        self.plan.trip(&self.plan.receives, "receive")?;
        self.inner.receive(max_messages).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner.ack(delivery).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.inner.retry(delivery, delay).await
    }

    async fn dead_letter(&self, delivery: &Delivery, dead_letter: DeadLetter) -> Result<()> {
        self.inner.dead_letter(delivery, dead_letter).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}
