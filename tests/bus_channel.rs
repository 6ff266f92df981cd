//! In-memory broker end to end through the public bus API.
//!
//! Run with: cargo test --test bus_channel

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use common::{service_bus, wait_until, Flaky, OrderPaid, OrderStarted, Recorder};
use integration_bus::bus::{BusError, ChannelBroker, ChannelConfig, ConsumerConfig};
use integration_bus::dlq::DeadLetterReason;
use integration_bus::handlers::{HandlerContainer, HandlerError, IntegrationEventHandler};
use integration_bus::{EventEnvelope, IntegrationEventBus};

#[tokio::test]
async fn test_publish_with_no_bindings_invokes_nothing() {
    let broker = ChannelBroker::new();
    let container = Arc::new(HandlerContainer::new());
    let recorder = Arc::new(Recorder::<OrderStarted>::new());
    container
        .register_instance::<OrderStarted, _>("billing.order-started", recorder.clone())
        .await;
    let billing = service_bus(&broker, "billing", container, 5);
    billing
        .subscribe::<OrderStarted>("billing.order-started")
        .await
        .unwrap();
    billing.start().await.unwrap();

    let publisher = service_bus(&broker, "checkout", Arc::new(HandlerContainer::new()), 5);
    publisher
        .publish(&OrderPaid {
            order_id: 1,
            amount_cents: 100,
            currency: "EUR".into(),
            items: vec![],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    billing.stop().await.unwrap();

    assert_eq!(recorder.count().await, 0);
    assert_eq!(broker.queue_depth("billing").await, 0);
}

#[tokio::test]
async fn test_n_bindings_produce_n_invocations() {
    let broker = ChannelBroker::new();
    let container = Arc::new(HandlerContainer::new());
    let recorders: Vec<_> = (0..3)
        .map(|_| Arc::new(Recorder::<OrderStarted>::new()))
        .collect();
    for (i, recorder) in recorders.iter().enumerate() {
        container
            .register_instance::<OrderStarted, _>(format!("orders.h{}", i), recorder.clone())
            .await;
    }
    let bus = service_bus(&broker, "orders", container, 5);
    for i in 0..3 {
        bus.subscribe::<OrderStarted>(format!("orders.h{}", i))
            .await
            .unwrap();
    }
    bus.start().await.unwrap();

    bus.publish(&OrderStarted { order_id: 7 }).await.unwrap();

    wait_until(|| {
        let broker = broker.clone();
        async move { broker.queue_depth("orders").await == 0 }
    })
    .await;
    bus.stop().await.unwrap();

    for recorder in &recorders {
        assert_eq!(recorder.seen().await, vec![OrderStarted { order_id: 7 }]);
    }
}

#[tokio::test]
async fn test_duplicate_subscribe_is_idempotent() {
    let broker = ChannelBroker::new();
    let bus = service_bus(&broker, "orders", Arc::new(HandlerContainer::new()), 5);

    bus.subscribe::<OrderStarted>("orders.audit").await.unwrap();
    bus.subscribe::<OrderStarted>("orders.audit").await.unwrap();

    assert_eq!(bus.registry().bindings("OrderStarted").await.len(), 1);
    assert!(matches!(
        bus.subscribe_to("OrderCancelled", "orders.audit").await,
        Err(BusError::DuplicateBinding(_))
    ));
}

#[tokio::test]
async fn test_payload_decode_failure_dead_letters_without_invocation() {
    let broker = ChannelBroker::new();
    let container = Arc::new(HandlerContainer::new());
    let flaky = Arc::new(Flaky::failing(0));
    container
        .register_instance::<OrderStarted, _>("orders.strict", flaky.clone())
        .await;
    let bus = service_bus(&broker, "orders", container, 5);
    bus.subscribe::<OrderStarted>("orders.strict").await.unwrap();
    bus.start().await.unwrap();

    let bad = EventEnvelope::new("OrderStarted", json!({"orderId": "not-a-number"})).unwrap();
    bus.publish_envelope(&bad).await.unwrap();

    wait_until(|| {
        let broker = broker.clone();
        async move { !broker.dead_letters("orders").await.is_empty() }
    })
    .await;
    bus.stop().await.unwrap();

    let dead = broker.dead_letters("orders").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::PayloadDecode);
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].envelope_id, Some(bad.id().to_string()));
    assert_eq!(flaky.calls(), 0);
    assert_eq!(broker.queue_depth("orders").await, 0);
}

#[tokio::test]
async fn test_malformed_body_dead_letters() {
    let broker = ChannelBroker::new();
    let bus = service_bus(&broker, "orders", Arc::new(HandlerContainer::new()), 5);
    bus.subscribe::<OrderStarted>("orders.audit").await.unwrap();
    bus.start().await.unwrap();

    broker
        .publish_raw("OrderStarted", b"{\"not\": \"an envelope\"}".to_vec())
        .await
        .unwrap();

    wait_until(|| {
        let broker = broker.clone();
        async move { !broker.dead_letters("orders").await.is_empty() }
    })
    .await;
    bus.stop().await.unwrap();

    let dead = broker.dead_letters("orders").await;
    assert_eq!(dead[0].reason, DeadLetterReason::Malformed);
    assert!(dead[0].envelope_id.is_none());
}

#[tokio::test]
async fn test_handler_failing_below_threshold_recovers() {
    let broker = ChannelBroker::new();
    let container = Arc::new(HandlerContainer::new());
    let flaky = Arc::new(Flaky::failing(3));
    container
        .register_instance::<OrderStarted, _>("orders.flaky", flaky.clone())
        .await;
    let bus = service_bus(&broker, "orders", container, 5);
    bus.subscribe::<OrderStarted>("orders.flaky").await.unwrap();
    bus.start().await.unwrap();

    bus.publish(&OrderStarted { order_id: 1 }).await.unwrap();

    wait_until(|| {
        let broker = broker.clone();
        async move { broker.queue_depth("orders").await == 0 }
    })
    .await;
    bus.stop().await.unwrap();

    assert_eq!(flaky.calls(), 4);
    assert!(broker.dead_letters("orders").await.is_empty());
}

#[tokio::test]
async fn test_handler_failing_beyond_threshold_dead_letters() {
    let broker = ChannelBroker::new();
    let container = Arc::new(HandlerContainer::new());
    let flaky = Arc::new(Flaky::failing(u32::MAX));
    container
        .register_instance::<OrderStarted, _>("orders.broken", flaky.clone())
        .await;
    let bus = service_bus(&broker, "orders", container, 2);
    bus.subscribe::<OrderStarted>("orders.broken").await.unwrap();
    bus.start().await.unwrap();

    bus.publish(&OrderStarted { order_id: 1 }).await.unwrap();

    wait_until(|| {
        let broker = broker.clone();
        async move { !broker.dead_letters("orders").await.is_empty() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.stop().await.unwrap();

    let dead = broker.dead_letters("orders").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(broker.queue_depth("orders").await, 0);
}

#[tokio::test]
async fn test_round_trip_preserves_payload() {
    let broker = ChannelBroker::new();
    let container = Arc::new(HandlerContainer::new());
    let recorder = Arc::new(Recorder::<OrderPaid>::new());
    container
        .register_instance::<OrderPaid, _>("billing.order-paid", recorder.clone())
        .await;
    let bus = service_bus(&broker, "billing", container, 5);
    bus.subscribe::<OrderPaid>("billing.order-paid").await.unwrap();
    bus.start().await.unwrap();

    let event = OrderPaid {
        order_id: 99,
        amount_cents: -1250,
        currency: "GBP".into(),
        items: vec!["tea".into(), "scone ☕".into()],
    };
    bus.publish(&event).await.unwrap();

    wait_until(|| {
        let recorder = recorder.clone();
        async move { recorder.count().await == 1 }
    })
    .await;
    bus.stop().await.unwrap();

    assert_eq!(recorder.seen().await, vec![event]);
}

#[tokio::test]
async fn test_order_started_scenario() {
    let broker = ChannelBroker::new();
    let container = Arc::new(HandlerContainer::new());
    let recorder = Arc::new(Recorder::<OrderStarted>::new());
    container
        .register_instance::<OrderStarted, _>("orders.order-started", recorder.clone())
        .await;
    let bus = service_bus(&broker, "orders", container, 5);
    bus.subscribe::<OrderStarted>("orders.order-started")
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(&OrderStarted { order_id: 42 }).await.unwrap();

    wait_until(|| {
        let broker = broker.clone();
        async move { broker.queue_depth("orders").await == 0 }
    })
    .await;
    bus.stop().await.unwrap();

    let seen = recorder.seen().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].order_id, 42);
    assert!(broker.dead_letters("orders").await.is_empty());
}

#[tokio::test]
async fn test_unknown_event_type_provisions_topic_lazily() {
    let broker = ChannelBroker::new();
    let bus = service_bus(&broker, "checkout", Arc::new(HandlerContainer::new()), 5);
    let envelope = EventEnvelope::new("Unknown", json!({})).unwrap();

    bus.publish_envelope(&envelope).await.unwrap();

    assert!(broker.topic_exists("Unknown").await);
}

#[tokio::test]
async fn test_unknown_event_type_without_auto_provisioning_fails() {
    let broker = ChannelBroker::new();
    let transport = Arc::new(broker.transport(
        "checkout",
        ChannelConfig {
            auto_provision_topics: false,
            ..common::channel_config()
        },
    ));
    let bus = IntegrationEventBus::new(
        transport,
        Arc::new(HandlerContainer::new()),
        ConsumerConfig::default(),
    );
    let envelope = EventEnvelope::new("Unknown", json!({})).unwrap();

    let err = bus.publish_envelope(&envelope).await.unwrap_err();

    assert!(matches!(err, BusError::TopicNotFound(ref t) if t == "Unknown"));
}

#[tokio::test]
async fn test_fan_out_across_services() {
    let broker = ChannelBroker::new();
    let mut buses = Vec::new();
    let mut recorders = Vec::new();
    for service in ["billing", "shipping"] {
        let container = Arc::new(HandlerContainer::new());
        let recorder = Arc::new(Recorder::<OrderStarted>::new());
        let binding = format!("{}.order-started", service);
        container
            .register_instance::<OrderStarted, _>(binding.as_str(), recorder.clone())
            .await;
        let bus = service_bus(&broker, service, container, 5);
        bus.subscribe::<OrderStarted>(binding).await.unwrap();
        bus.start().await.unwrap();
        buses.push(bus);
        recorders.push(recorder);
    }

    buses[0].publish(&OrderStarted { order_id: 3 }).await.unwrap();

    for recorder in &recorders {
        let recorder = recorder.clone();
        wait_until(move || {
            let recorder = recorder.clone();
            async move { recorder.count().await == 1 }
        })
        .await;
    }
    for bus in &buses {
        bus.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_independent_buses_do_not_share_registries() {
    let broker = ChannelBroker::new();
    let a = service_bus(&broker, "a", Arc::new(HandlerContainer::new()), 5);
    let b = service_bus(&broker, "b", Arc::new(HandlerContainer::new()), 5);

    a.subscribe::<OrderStarted>("a.audit").await.unwrap();

    assert!(a.registry().has_bindings("OrderStarted").await);
    assert!(b.registry().is_empty().await);
}

struct SlowHandler {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl IntegrationEventHandler<OrderStarted> for SlowHandler {
    async fn handle(&self, _event: OrderStarted, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_graceful_stop_completes_in_flight_dispatch() {
    let broker = ChannelBroker::new();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let container = Arc::new(HandlerContainer::new());
    container
        .register_instance::<OrderStarted, _>(
            "orders.slow",
            Arc::new(SlowHandler {
                started: started.clone(),
                finished: finished.clone(),
            }),
        )
        .await;
    let bus = service_bus(&broker, "orders", container, 5);
    bus.subscribe::<OrderStarted>("orders.slow").await.unwrap();
    bus.start().await.unwrap();

    bus.publish(&OrderStarted { order_id: 1 }).await.unwrap();
    wait_until(|| {
        let started = started.clone();
        async move { started.load(Ordering::SeqCst) }
    })
    .await;

    bus.stop().await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.queue_depth("orders").await, 0);
    assert!(matches!(
        bus.publish(&OrderStarted { order_id: 2 }).await,
        Err(BusError::ShutdownInProgress)
    ));
}

#[tokio::test]
async fn test_replica_stop_keeps_shared_queue_subscribed() {
    let broker = ChannelBroker::new();
    let mut replicas = Vec::new();
    for _ in 0..2 {
        let container = Arc::new(HandlerContainer::new());
        let recorder = Arc::new(Recorder::<OrderStarted>::new());
        container
            .register_instance::<OrderStarted, _>("orders.order-started", recorder.clone())
            .await;
        let bus = service_bus(&broker, "orders", container, 5);
        bus.subscribe::<OrderStarted>("orders.order-started")
            .await
            .unwrap();
        bus.start().await.unwrap();
        replicas.push((bus, recorder));
    }
    let (stopped, _) = &replicas[0];
    let (survivor, survivor_seen) = &replicas[1];

    stopped.stop().await.unwrap();
    survivor.publish(&OrderStarted { order_id: 21 }).await.unwrap();

    let recorder = survivor_seen.clone();
    wait_until(move || {
        let recorder = recorder.clone();
        async move { recorder.count().await == 1 }
    })
    .await;
    assert!(broker.is_bound("OrderStarted", "orders").await);

    // With every replica down the queue keeps collecting.
    survivor.stop().await.unwrap();
    let checkout = service_bus(&broker, "checkout", Arc::new(HandlerContainer::new()), 5);
    checkout.publish(&OrderStarted { order_id: 22 }).await.unwrap();
    assert_eq!(broker.queue_depth("orders").await, 1);
}
