//! Shared test fixtures.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::envelope::{EventEnvelope, IntegrationEvent};
use crate::handlers::{HandlerError, IntegrationEventHandler};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStarted {
    pub order_id: u64,
}

impl IntegrationEvent for OrderStarted {
    const EVENT_TYPE_NAME: &'static str = "OrderStarted";
}

/// Records every order id it handles.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<u64>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn order_ids(&self) -> Vec<u64> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderStarted> for RecordingHandler {
    async fn handle(&self, event: OrderStarted, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.seen.lock().await.push(event.order_id);
        Ok(())
    }
}

/// Fails the first `n` calls, then succeeds.
pub struct FlakyHandler {
    fail_first: u32,
    calls: AtomicU32,
    successes: AtomicU32,
}

impl FlakyHandler {
    pub fn failing(n: u32) -> Self {
        Self {
            fail_first: n,
            calls: AtomicU32::new(0),
            successes: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> u32 {
        self.successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderStarted> for FlakyHandler {
    async fn handle(&self, event: OrderStarted, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(format!("order {} failed on attempt {}", event.order_id, call).into());
        }
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
