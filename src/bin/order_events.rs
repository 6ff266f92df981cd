//! order-events: sample consumer for `OrderStarted` integration events.
//!
//! Subscribes a logging handler to `OrderStarted` and runs the bus until
//! Ctrl+C.
//!
//! ## Configuration
//! - EVENTBUS_CONFIG: Path to a YAML config file (optional)
//! - EVENTBUS__BUS__SERVICE_NAME etc.: Per-key overrides
//! - EVENTBUS_LOG: Log filter (default: info)
//! - ORDER_EVENTS_PUBLISH: Order id to publish once at startup (optional)

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use integration_bus::config::Config;
use integration_bus::handlers::{HandlerContainer, HandlerError, IntegrationEventHandler};
use integration_bus::utils::bootstrap::{init_event_bus, init_tracing, run_until_shutdown};
use integration_bus::{EventEnvelope, IntegrationEvent};

const HANDLER_BINDING: &str = "orders.order-started-log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStarted {
    order_id: u64,
}

impl IntegrationEvent for OrderStarted {
    const EVENT_TYPE_NAME: &'static str = "OrderStarted";
}

struct OrderStartedLogger;

#[async_trait]
impl IntegrationEventHandler<OrderStarted> for OrderStartedLogger {
    async fn handle(&self, event: OrderStarted, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        info!(
            order_id = event.order_id,
            envelope_id = %envelope.id(),
            created_at = %envelope.created_at(),
            "Order started"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;

    let container = Arc::new(HandlerContainer::new());
    container
        .register::<OrderStarted, _, _>(HANDLER_BINDING, || OrderStartedLogger)
        .await;

    let bus = init_event_bus(&config, container).await?;
    bus.subscribe::<OrderStarted>(HANDLER_BINDING).await?;

    info!(service = %config.bus.service_name, "order-events started");

    if let Some(order_id) = std::env::var("ORDER_EVENTS_PUBLISH")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        let id = bus.publish(&OrderStarted { order_id }).await?;
        info!(order_id, envelope_id = %id, "Published OrderStarted");
    }

    run_until_shutdown(&bus).await
}
