use super::*;
use crate::dlq::DeadLetterReason;
use serde_json::json;

fn envelope(event_type: &str) -> EventEnvelope {
    EventEnvelope::new(event_type, json!({"orderId": 1})).unwrap()
}

fn quick() -> ChannelConfig {
    ChannelConfig {
        wait_time: Duration::from_millis(20),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_send_auto_provisions_topic() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());

    tokio_test::assert_ok!(transport.send(&envelope("Unknown")).await);

    assert!(broker.topic_exists("Unknown").await);
}

#[tokio::test]
async fn test_send_without_provisioning_fails() {
    let broker = ChannelBroker::new();
    let transport = broker.transport(
        "orders",
        ChannelConfig {
            auto_provision_topics: false,
            ..quick()
        },
    );

    let result = transport.send(&envelope("Unknown")).await;

    let err = tokio_test::assert_err!(result);
    assert!(matches!(err, BusError::TopicNotFound(t) if t == "Unknown"));
    assert!(!broker.topic_exists("Unknown").await);
}

#[tokio::test]
async fn test_fan_out_to_bound_queues_only() {
    let broker = ChannelBroker::new();
    let orders = broker.transport("orders", quick());
    let billing = broker.transport("billing", quick());
    let shipping = broker.transport("shipping", quick());
    orders.ensure_listening("OrderStarted").await.unwrap();
    billing.ensure_listening("OrderStarted").await.unwrap();
    shipping.ensure_listening("OrderShipped").await.unwrap();

    orders.send(&envelope("OrderStarted")).await.unwrap();

    assert_eq!(orders.receive(10).await.unwrap().len(), 1);
    assert_eq!(billing.receive(10).await.unwrap().len(), 1);
    assert!(shipping.receive(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ensure_listening_is_idempotent() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();
    transport.ensure_listening("OrderStarted").await.unwrap();

    transport.send(&envelope("OrderStarted")).await.unwrap();

    assert_eq!(transport.receive(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stop_listening() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();
    transport.stop_listening("OrderStarted").await.unwrap();

    transport.send(&envelope("OrderStarted")).await.unwrap();

    assert!(!broker.is_bound("OrderStarted", "orders").await);
    assert!(transport.receive(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_receive_respects_batch_size() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();
    for _ in 0..5 {
        transport.send(&envelope("OrderStarted")).await.unwrap();
    }

    assert_eq!(transport.receive(3).await.unwrap().len(), 3);
    assert_eq!(transport.receive(3).await.unwrap().len(), 2);
    assert_eq!(broker.queue_depth("orders").await, 5);
}

#[tokio::test]
async fn test_receive_waits_for_publish() {
    let broker = ChannelBroker::new();
    let consumer = broker.transport(
        "orders",
        ChannelConfig {
            wait_time: Duration::from_secs(5),
            ..Default::default()
        },
    );
    consumer.ensure_listening("OrderStarted").await.unwrap();
    let producer = broker.transport("checkout", quick());

    let pending = tokio::spawn(async move { consumer.receive(1).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    producer.send(&envelope("OrderStarted")).await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn test_ack_removes_message() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();
    transport.send(&envelope("OrderStarted")).await.unwrap();

    let delivery = transport.receive(1).await.unwrap().remove(0);
    transport.ack(&delivery).await.unwrap();

    assert_eq!(broker.queue_depth("orders").await, 0);
}

#[tokio::test]
async fn test_retry_increments_receive_count() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();
    transport.send(&envelope("OrderStarted")).await.unwrap();

    let first = transport.receive(1).await.unwrap().remove(0);
    assert_eq!(first.receive_count, 1);
    transport.retry(&first, Duration::ZERO).await.unwrap();

    let second = transport.receive(1).await.unwrap().remove(0);
    assert_eq!(second.receive_count, 2);
    assert_eq!(second.message_id, first.message_id);
    assert_ne!(second.receipt, first.receipt);
}

#[tokio::test]
async fn test_retry_delay_hides_message() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();
    transport.send(&envelope("OrderStarted")).await.unwrap();

    let first = transport.receive(1).await.unwrap().remove(0);
    transport.retry(&first, Duration::from_millis(200)).await.unwrap();

    assert!(transport.receive(1).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(transport.receive(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dead_letter_parks_message() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();
    broker
        .publish_raw("OrderStarted", b"garbage".to_vec())
        .await
        .unwrap();

    let delivery = transport.receive(1).await.unwrap().remove(0);
    let dead_letter = DeadLetter::malformed(&delivery, transport.queue_name(), "bad");
    transport.dead_letter(&delivery, dead_letter).await.unwrap();

    let parked = broker.dead_letters("orders").await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].reason, DeadLetterReason::Malformed);
    assert_eq!(broker.queue_depth("orders").await, 0);
}

#[tokio::test]
async fn test_publish_raw_unknown_topic() {
    let broker = ChannelBroker::new();
    tokio_test::assert_err!(broker.publish_raw("Nope", b"{}".to_vec()).await);
}

#[tokio::test]
async fn test_shutdown_keeps_subscriptions_by_default() {
    let broker = ChannelBroker::new();
    let transport = broker.transport("orders", quick());
    transport.ensure_listening("OrderStarted").await.unwrap();

    transport.shutdown().await.unwrap();

    assert!(broker.is_bound("OrderStarted", "orders").await);
}

#[tokio::test]
async fn test_shutdown_releases_subscriptions_when_enabled() {
    let broker = ChannelBroker::new();
    let transport = broker.transport(
        "orders",
        ChannelConfig {
            release_subscriptions_on_stop: true,
            ..quick()
        },
    );
    transport.ensure_listening("OrderStarted").await.unwrap();
    transport.ensure_listening("OrderShipped").await.unwrap();

    transport.shutdown().await.unwrap();

    assert!(!broker.is_bound("OrderStarted", "orders").await);
    assert!(!broker.is_bound("OrderShipped", "orders").await);
    assert!(broker.topic_exists("OrderStarted").await);
}
