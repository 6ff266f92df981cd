//! Bus behaviour configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::ConsumerConfig;

/// Bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Consuming service name; names the service queue and its DLQ.
    pub service_name: String,
    /// Redeliveries allowed before a failing message is dead-lettered.
    pub max_retries: u32,
    /// Messages pulled per receive call.
    pub batch_size: usize,
    /// Messages processed concurrently.
    pub concurrency: usize,
    /// Upper bound for a publish, including transport retries.
    pub publish_timeout_ms: u64,
    /// Visibility delay before the first redelivery (doubles per attempt).
    pub retry_base_delay_ms: u64,
    /// Cap for the redelivery delay.
    pub retry_max_delay_ms: u64,
    /// Park terminal failures in the DLQ. When false they are deleted and logged.
    pub dead_letter_enabled: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: "integration-bus".to_string(),
            max_retries: 5,
            batch_size: 10,
            concurrency: 8,
            publish_timeout_ms: 10_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            dead_letter_enabled: true,
        }
    }
}

impl BusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Receive-loop settings derived from this configuration.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            dead_letter_enabled: self.dead_letter_enabled,
        }
    }
}
