//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use integration_bus::bus::{ChannelBroker, ChannelConfig, ConsumerConfig};
use integration_bus::handlers::{HandlerError, HandlerResolver, IntegrationEventHandler};
use integration_bus::{EventEnvelope, IntegrationEvent, IntegrationEventBus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStarted {
    pub order_id: u64,
}

impl IntegrationEvent for OrderStarted {
    const EVENT_TYPE_NAME: &'static str = "OrderStarted";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaid {
    pub order_id: u64,
    pub amount_cents: i64,
    pub currency: String,
    pub items: Vec<String>,
}

impl IntegrationEvent for OrderPaid {
    const EVENT_TYPE_NAME: &'static str = "ordering.OrderPaid";
}

/// Records every event it handles.
pub struct Recorder<E> {
    seen: Mutex<Vec<E>>,
}

impl<E: Clone> Recorder<E> {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }

    pub async fn seen(&self) -> Vec<E> {
        self.seen.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[async_trait]
impl<E: IntegrationEvent + Clone> IntegrationEventHandler<E> for Recorder<E> {
    async fn handle(&self, event: E, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.seen.lock().await.push(event);
        Ok(())
    }
}

/// Fails the first `n` calls, then succeeds.
pub struct Flaky {
    fail_first: u32,
    calls: AtomicU32,
}

impl Flaky {
    pub fn failing(n: u32) -> Self {
        Self {
            fail_first: n,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderStarted> for Flaky {
    async fn handle(&self, _event: OrderStarted, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(format!("attempt {} failed", call).into());
        }
        Ok(())
    }
}

pub fn channel_config() -> ChannelConfig {
    ChannelConfig {
        wait_time: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn consumer_config(max_retries: u32) -> ConsumerConfig {
    ConsumerConfig {
        max_retries,
        retry_base_delay: Duration::ZERO,
        ..Default::default()
    }
}

/// Build a bus for `service` on a shared broker.
pub fn service_bus(
    broker: &ChannelBroker,
    service: &str,
    resolver: Arc<dyn HandlerResolver>,
    max_retries: u32,
) -> IntegrationEventBus {
    let transport = Arc::new(broker.transport(service, channel_config()));
    IntegrationEventBus::new(transport, resolver, consumer_config(max_retries))
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}
