//! Transport configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::ChannelConfig;
#[cfg(feature = "sns-sqs")]
use crate::bus::SnsSqsConfig;

/// Transport type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    /// In-process broker (no external dependencies).
    #[default]
    Channel,
    /// AWS SNS topics with SQS queues.
    SnsSqs,
}

/// Transport configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport type discriminator.
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    /// Prefix for topic and queue names.
    pub topic_prefix: String,
    /// Create missing topics on publish instead of failing with `TopicNotFound`.
    pub auto_provision_topics: bool,
    /// Long-poll wait per receive call.
    pub wait_time_secs: u64,
    /// SQS visibility timeout for in-flight messages.
    pub visibility_timeout_secs: i32,
    /// AWS region. Uses the default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (LocalStack).
    pub endpoint_url: Option<String>,
    /// Unsubscribe the service queue from its topics on shutdown. The queue
    /// is shared by all replicas; only safe for single-instance services.
    pub release_subscriptions_on_stop: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Channel,
            topic_prefix: "eventbus".to_string(),
            auto_provision_topics: true,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
            region: None,
            endpoint_url: None,
            release_subscriptions_on_stop: false,
        }
    }
}

impl TransportConfig {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            auto_provision_topics: self.auto_provision_topics,
            wait_time: Duration::from_secs(self.wait_time_secs),
            release_subscriptions_on_stop: self.release_subscriptions_on_stop,
        }
    }

    #[cfg(feature = "sns-sqs")]
    pub fn sns_sqs_config(&self, service_name: &str) -> SnsSqsConfig {
        let mut config = SnsSqsConfig::new(service_name)
            .with_topic_prefix(&self.topic_prefix)
            .with_visibility_timeout(self.visibility_timeout_secs)
            .with_wait_time(self.wait_time_secs.min(20) as i32)
            .with_auto_provision_topics(self.auto_provision_topics)
            .with_release_subscriptions_on_stop(self.release_subscriptions_on_stop);
        if let Some(ref region) = self.region {
            config = config.with_region(region);
        }
        if let Some(ref endpoint) = self.endpoint_url {
            config = config.with_endpoint(endpoint);
        }
        config
    }
}
