//! In-memory broker for standalone mode and tests.
//!
//! Models the same topology as a real broker: one topic per event type fans
//! out to every queue bound to it, one queue per consuming service, one DLQ
//! per queue. Several [`ChannelTransport`]s created from the same
//! [`ChannelBroker`] behave like separate services sharing a broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BusError, Delivery, Result, Transport};
use crate::dlq::DeadLetter;
use crate::envelope::EventEnvelope;

/// Configuration for a channel transport.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Create missing topics on send instead of failing with `TopicNotFound`.
    pub auto_provision_topics: bool,
    /// How long an empty receive waits for messages.
    pub wait_time: Duration,
    /// Unbind the queue from every topic on shutdown. Every replica of a
    /// service shares its queue, so leave this off unless the service runs
    /// a single instance.
    pub release_subscriptions_on_stop: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auto_provision_topics: true,
            wait_time: Duration::from_secs(1),
            release_subscriptions_on_stop: false,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    receive_count: u32,
    visible_at: Instant,
}

struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            dead_letters: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, message: StoredMessage) {
        self.ready.push_back(message);
        self.notify.notify_one();
    }

    /// Move up to `max` visible messages in flight, oldest first.
    fn take_visible(&mut self, now: Instant, max: usize) -> Vec<Delivery> {
        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.ready.len());

        while let Some(mut message) = self.ready.pop_front() {
            if taken.len() < max && message.visible_at <= now {
                message.receive_count += 1;
                let receipt = format!("{}:{}", message.message_id, message.receive_count);
                taken.push(Delivery {
                    message_id: message.message_id.clone(),
                    receipt: receipt.clone(),
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                });
                self.in_flight.insert(receipt, message);
            } else {
                remaining.push_back(message);
            }
        }

        self.ready = remaining;
        taken
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.ready.iter().map(|m| m.visible_at).min()
    }
}

#[derive(Default)]
struct BrokerState {
    /// Topic name to the queues bound to it.
    topics: HashMap<String, HashSet<String>>,
    queues: HashMap<String, QueueState>,
}

impl BrokerState {
    fn fan_out(&mut self, topic: &str, body: &[u8]) -> usize {
        let Some(bound) = self.topics.get(topic) else {
            return 0;
        };
        let message_id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut delivered = 0;
        for queue_name in bound {
            if let Some(queue) = self.queues.get_mut(queue_name) {
                queue.push(StoredMessage {
                    message_id: message_id.clone(),
                    body: body.to_vec(),
                    receive_count: 0,
                    visible_at: now,
                });
                delivered += 1;
            }
        }
        delivered
    }
}

/// Shared in-memory broker.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport for one consuming service, provisioning its queue.
    pub fn transport(&self, service_name: &str, config: ChannelConfig) -> ChannelTransport {
        info!(queue = %service_name, "Channel transport initialized");
        ChannelTransport {
            broker: self.clone(),
            queue: service_name.to_string(),
            config,
        }
    }

    /// Publish raw bytes to a topic, bypassing envelope encoding.
    ///
    /// Returns the number of queues the body was delivered to.
    pub async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> Result<usize> {
        let mut state = self.state.lock().await;
        if !state.topics.contains_key(topic) {
            return Err(BusError::TopicNotFound(topic.to_string()));
        }
        Ok(state.fan_out(topic, &body))
    }

    pub async fn topic_exists(&self, topic: &str) -> bool {
        self.state.lock().await.topics.contains_key(topic)
    }

    /// Whether `queue` is bound to `topic`.
    pub async fn is_bound(&self, topic: &str, queue: &str) -> bool {
        self.state
            .lock()
            .await
            .topics
            .get(topic)
            .is_some_and(|queues| queues.contains(queue))
    }

    /// Messages waiting or in flight on a queue.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.in_flight.len())
            .unwrap_or(0)
    }

    /// Dead letters parked for a queue.
    pub async fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }
}

/// One service's view of a [`ChannelBroker`].
pub struct ChannelTransport {
    broker: ChannelBroker,
    queue: String,
    config: ChannelConfig,
}

impl ChannelTransport {
    pub fn broker(&self) -> &ChannelBroker {
        &self.broker
    }

    async fn with_queue<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut state = self.broker.state.lock().await;
        let queue = state
            .queues
            .entry(self.queue.clone())
            .or_insert_with(QueueState::new);
        f(queue)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn ensure_listening(&self, event_type_name: &str) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state
            .queues
            .entry(self.queue.clone())
            .or_insert_with(QueueState::new);
        let newly_bound = state
            .topics
            .entry(event_type_name.to_string())
            .or_default()
            .insert(self.queue.clone());
        if newly_bound {
            info!(topic = %event_type_name, queue = %self.queue, "Queue bound to topic");
        }
        Ok(())
    }

    async fn stop_listening(&self, event_type_name: &str) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        if let Some(queues) = state.topics.get_mut(event_type_name) {
            if queues.remove(&self.queue) {
                info!(topic = %event_type_name, queue = %self.queue, "Queue unbound from topic");
            }
        }
        Ok(())
    }

    async fn send(&self, envelope: &EventEnvelope) -> Result<()> {
        let topic = envelope.event_type_name();
        let body = envelope.encode()?;

        let mut state = self.broker.state.lock().await;
        if !state.topics.contains_key(topic) {
            if !self.config.auto_provision_topics {
                return Err(BusError::TopicNotFound(topic.to_string()));
            }
            debug!(topic = %topic, "Creating topic on publish");
            state.topics.insert(topic.to_string(), HashSet::new());
        }

        let delivered = state.fan_out(topic, &body);
        debug!(
            topic = %topic,
            envelope_id = %envelope.id(),
            queues = delivered,
            "Published envelope to channel"
        );
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + self.config.wait_time;

        loop {
            let (batch, notify, next_visible) = self
                .with_queue(|queue| {
                    let batch = queue.take_visible(Instant::now(), max_messages);
                    (batch, queue.notify.clone(), queue.next_visible_at())
                })
                .await;

            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let removed = self
            .with_queue(|queue| queue.in_flight.remove(&delivery.receipt))
            .await;
        if removed.is_none() {
            warn!(receipt = %delivery.receipt, "Ack for unknown receipt");
        }
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.with_queue(|queue| {
            if let Some(mut message) = queue.in_flight.remove(&delivery.receipt) {
                message.visible_at = Instant::now() + delay;
                queue.push(message);
            } else {
                warn!(receipt = %delivery.receipt, "Retry for unknown receipt");
            }
        })
        .await;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, dead_letter: DeadLetter) -> Result<()> {
        self.with_queue(|queue| {
            queue.in_flight.remove(&delivery.receipt);
            queue.dead_letters.push(dead_letter);
        })
        .await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.config.release_subscriptions_on_stop {
            return Ok(());
        }
        let mut state = self.broker.state.lock().await;
        for queues in state.topics.values_mut() {
            queues.remove(&self.queue);
        }
        info!(queue = %self.queue, "Channel transport released subscriptions");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
