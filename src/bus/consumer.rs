//! Receive loop.
//!
//! Pulls batches from the service queue, dispatches each message and settles
//! it with the broker: ack, retry with a visibility delay, or dead-letter.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatch::{DispatchOutcome, Dispatcher};
use super::{Delivery, Result, Transport};
use crate::dlq::{DeadLetter, DeadLetterReason};
use crate::envelope::EventEnvelope;
use crate::utils::retry::{receive_backoff, redelivery_delay};

/// Receive loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages pulled per receive call.
    pub batch_size: usize,
    /// Messages processed concurrently.
    pub concurrency: usize,
    /// Redeliveries allowed before dead-lettering.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// When false, terminal failures are deleted and logged instead.
    pub dead_letter_enabled: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 8,
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            dead_letter_enabled: true,
        }
    }
}

/// How a received message was settled with the broker.
///
/// Malformed bodies go straight to `DeadLettered` without dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Deleted from the queue.
    Acknowledged,
    /// Left on the queue for redelivery after a delay.
    Retried,
    /// Moved to the dead-letter queue.
    DeadLettered,
}

/// Process one delivery end to end and return its terminal state.
///
/// Errors are transport failures while settling the message; the broker
/// redelivers it once its visibility timeout lapses.
pub async fn process_delivery(
    transport: &dyn Transport,
    dispatcher: &Dispatcher,
    config: &ConsumerConfig,
    delivery: Delivery,
) -> Result<MessageState> {
    let queue = transport.queue_name().to_string();

    let envelope = match EventEnvelope::decode(&delivery.body) {
        Ok(envelope) => Arc::new(envelope),
        Err(e) => {
            error!(
                message_id = %delivery.message_id,
                queue = %queue,
                error = %e,
                "Malformed message"
            );
            let dead_letter = DeadLetter::malformed(&delivery, &queue, e.to_string());
            return park(transport, config, &delivery, dead_letter).await;
        }
    };

    let outcome = dispatcher.process_message(Arc::clone(&envelope)).await;
    debug!(
        message_id = %delivery.message_id,
        success = outcome.is_success(),
        "Message dispatched"
    );

    match outcome {
        DispatchOutcome::Success { .. } => {
            transport.ack(&delivery).await?;
            Ok(MessageState::Acknowledged)
        }
        DispatchOutcome::DecodeError { .. } => {
            let dead_letter = DeadLetter::for_envelope(
                &delivery,
                &envelope,
                &queue,
                DeadLetterReason::PayloadDecode,
                outcome.failure_summary(),
            )
            .with_metadata("failed_bindings", failed_bindings(&outcome));
            park(transport, config, &delivery, dead_letter).await
        }
        DispatchOutcome::HandlerFailed { .. } => {
            let retries = delivery.retries();
            if retries >= config.max_retries {
                warn!(
                    message_id = %delivery.message_id,
                    event_type = %envelope.event_type_name(),
                    attempts = delivery.receive_count,
                    "Retries exhausted"
                );
                let dead_letter = DeadLetter::for_envelope(
                    &delivery,
                    &envelope,
                    &queue,
                    DeadLetterReason::RetriesExhausted,
                    outcome.failure_summary(),
                )
                .with_metadata("failed_bindings", failed_bindings(&outcome));
                return park(transport, config, &delivery, dead_letter).await;
            }

            let delay = redelivery_delay(config.retry_base_delay, config.retry_max_delay, retries);
            debug!(
                message_id = %delivery.message_id,
                attempt = delivery.receive_count,
                delay_ms = delay.as_millis() as u64,
                "Scheduling redelivery"
            );
            transport.retry(&delivery, delay).await?;
            Ok(MessageState::Retried)
        }
    }
}

async fn park(
    transport: &dyn Transport,
    config: &ConsumerConfig,
    delivery: &Delivery,
    dead_letter: DeadLetter,
) -> Result<MessageState> {
    if !config.dead_letter_enabled {
        error!(
            message_id = %delivery.message_id,
            reason = %dead_letter.reason,
            error = %dead_letter.error,
            "Dead-lettering disabled, dropping message"
        );
        transport.ack(delivery).await?;
        return Ok(MessageState::Acknowledged);
    }

    warn!(
        message_id = %delivery.message_id,
        reason = %dead_letter.reason,
        "Message dead-lettered"
    );
    transport.dead_letter(delivery, dead_letter).await?;
    Ok(MessageState::DeadLettered)
}

fn failed_bindings(outcome: &DispatchOutcome) -> String {
    outcome
        .failures()
        .iter()
        .map(|f| f.binding_id().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Handle to a running receive loop.
pub struct ConsumerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Spawn the receive loop on the current runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(transport, dispatcher, config, stop_rx));
        Self { stop, task }
    }

    /// Signal the loop and wait for in-flight messages to settle.
    ///
    /// A receive already in progress completes and its batch is processed,
    /// so shutdown can take up to the transport's wait time.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Receive loop task failed");
        }
    }
}

async fn run(
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    config: ConsumerConfig,
    mut stop: watch::Receiver<bool>,
) {
    info!(
        transport = transport.name(),
        queue = %transport.queue_name(),
        batch_size = config.batch_size,
        concurrency = config.concurrency,
        "Receive loop started"
    );

    let mut backoff = None;

    loop {
        if *stop.borrow_and_update() {
            break;
        }

        // Not raced against `stop`: a dropped long poll strands messages the
        // broker already handed out until their visibility timeout lapses.
        let received = transport.receive(config.batch_size).await;

        match received {
            Ok(batch) => {
                backoff = None;
                if batch.is_empty() {
                    continue;
                }
                debug!(count = batch.len(), "Received batch");

                let transport = transport.as_ref();
                let dispatcher = dispatcher.as_ref();
                let config = &config;
                futures::stream::iter(batch)
                    .for_each_concurrent(config.concurrency, |delivery| async move {
                        let message_id = delivery.message_id.clone();
                        if let Err(e) = process_delivery(transport, dispatcher, config, delivery).await
                        {
                            error!(
                                message_id = %message_id,
                                error = %e,
                                "Failed to settle message"
                            );
                        }
                    })
                    .await;
            }
            Err(e) => {
                let delay = backoff
                    .get_or_insert_with(|| receive_backoff().build())
                    .next()
                    .unwrap_or(Duration::from_secs(30));
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Receive failed, backing off"
                );
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!(queue = %transport.queue_name(), "Receive loop stopped");
}
