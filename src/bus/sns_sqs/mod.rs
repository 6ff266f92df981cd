//! AWS SNS/SQS transport.
//!
//! One SNS topic per event type, one SQS queue per consuming service
//! subscribed to every topic the service listens on (raw message delivery),
//! and one SQS dead-letter queue per service queue.
//!
//! Topic naming: `{topic_prefix}-{event_type}` (dots become dashes for AWS,
//! so `a.b` and `a-b` share a topic; pick one separator per deployment)
//! Queue naming: `{topic_prefix}-{service_name}`
//! DLQ naming: `{topic_prefix}-{service_name}-dlq`
//!
//! Retries rely on SQS itself: a failed message's visibility timeout is
//! shortened to the redelivery delay and `ApproximateReceiveCount` is the
//! attempt counter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::config::http::HttpResponse;
use aws_sdk_sns::error::{DisplayErrorContext, SdkError};
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use serde_json::json;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::{BusError, Delivery, Result, Transport};
use crate::dlq::{dlq_name_for_queue, DeadLetter};
use crate::envelope::{EnvelopeError, EventEnvelope};

/// Message attribute carrying the event type name.
const EVENT_TYPE_ATTR: &str = "eventTypeName";

/// Message attribute carrying the dead-letter reason.
const DLQ_REASON_ATTR: &str = "deadLetterReason";

/// SQS caps a single receive at 10 messages.
const SQS_MAX_BATCH: usize = 10;

/// SQS caps visibility timeouts at 12 hours.
const SQS_MAX_VISIBILITY_SECS: u64 = 43_200;

/// SNS topic names are at most 256 characters.
const SNS_MAX_TOPIC_NAME_LEN: usize = 256;

/// Configuration for AWS SNS/SQS connection.
#[derive(Clone, Debug)]
pub struct SnsSqsConfig {
    /// AWS region (e.g., "us-east-1"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
    /// Prefix for topic and queue names (default: "eventbus").
    pub topic_prefix: String,
    /// Consuming service; names the queue.
    pub service_name: String,
    /// Visibility timeout in seconds for SQS messages (default: 30).
    pub visibility_timeout_secs: i32,
    /// Wait time seconds for long polling (default: 20, SQS maximum).
    pub wait_time_secs: i32,
    /// Create missing topics on publish (default: true).
    pub auto_provision_topics: bool,
    /// Unsubscribe the queue from its topics on shutdown (default: false).
    ///
    /// The queue is shared by every replica of the service, so only enable
    /// this for single-instance deployments.
    pub release_subscriptions_on_stop: bool,
}

impl SnsSqsConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            region: None,
            endpoint_url: None,
            topic_prefix: "eventbus".to_string(),
            service_name: service_name.into(),
            visibility_timeout_secs: 30,
            wait_time_secs: 20,
            auto_provision_topics: true,
            release_subscriptions_on_stop: false,
        }
    }

    /// Set AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set custom endpoint URL (for LocalStack or testing).
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Set topic prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Set visibility timeout in seconds.
    pub fn with_visibility_timeout(mut self, secs: i32) -> Self {
        self.visibility_timeout_secs = secs;
        self
    }

    /// Set long-poll wait time in seconds.
    pub fn with_wait_time(mut self, secs: i32) -> Self {
        self.wait_time_secs = secs;
        self
    }

    pub fn with_auto_provision_topics(mut self, enabled: bool) -> Self {
        self.auto_provision_topics = enabled;
        self
    }

    pub fn with_release_subscriptions_on_stop(mut self, enabled: bool) -> Self {
        self.release_subscriptions_on_stop = enabled;
        self
    }

    /// Build the SNS topic name for an event type.
    /// Uses dashes instead of dots for AWS compatibility.
    ///
    /// Fails if the prefixed name exceeds the SNS topic name limit.
    pub fn topic_for_event_type(&self, event_type_name: &str) -> Result<String> {
        let sanitized = event_type_name.replace('.', "-");
        let topic_name = format!("{}-{}", self.topic_prefix, sanitized);
        if topic_name.len() > SNS_MAX_TOPIC_NAME_LEN {
            return Err(BusError::InvalidEventType {
                name: event_type_name.to_string(),
                reason: "SNS topic name would exceed 256 characters",
            });
        }
        Ok(topic_name)
    }

    /// Build the service's SQS queue name.
    pub fn queue_name(&self) -> String {
        format!("{}-{}", self.topic_prefix, self.service_name)
    }

    /// Build the DLQ queue name.
    pub fn dlq_queue_name(&self) -> String {
        dlq_name_for_queue(&self.queue_name())
    }
}

fn unavailable(context: &str, e: impl std::error::Error) -> BusError {
    BusError::TransportUnavailable(format!("{}: {}", context, DisplayErrorContext(e)))
}

fn provisioning(context: &str, e: impl std::error::Error) -> BusError {
    BusError::Provisioning(format!("{}: {}", context, DisplayErrorContext(e)))
}

/// Map a failed provisioning call.
///
/// Connection failures, timeouts, unparseable responses and 5xx replies are
/// `TransportUnavailable` so publish and startup retries apply; service
/// rejections stay `Provisioning`.
fn provisioning_call<E>(context: &str, e: SdkError<E, HttpResponse>) -> BusError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &e {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => e
            .raw_response()
            .is_some_and(|response| response.status().as_u16() >= 500),
        _ => false,
    };
    if transient {
        unavailable(context, e)
    } else {
        provisioning(context, e)
    }
}

/// AWS SNS/SQS transport for one consuming service.
pub struct SnsSqsTransport {
    sns: SnsClient,
    sqs: SqsClient,
    config: SnsSqsConfig,
    queue_name: String,
    queue_url: String,
    queue_arn: String,
    dlq_url: OnceCell<String>,
    /// Cache of SNS topic ARNs by topic name.
    topic_arns: RwLock<HashMap<String, String>>,
    /// SNS subscription ARNs by event type.
    subscriptions: RwLock<HashMap<String, String>>,
}

impl SnsSqsTransport {
    /// Connect and provision the service queue.
    pub async fn new(config: SnsSqsConfig) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let sns = SnsClient::new(&aws_config);
        let sqs = SqsClient::new(&aws_config);

        let queue_name = config.queue_name();
        let queue_url = create_queue(&sqs, &queue_name, config.visibility_timeout_secs).await?;
        let queue_arn = queue_arn(&sqs, &queue_url).await?;
        allow_topic_delivery(&sqs, &queue_url, &queue_arn, &config.topic_prefix).await?;

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            queue = %queue_name,
            "Connected to AWS SNS/SQS"
        );

        Ok(Self {
            sns,
            sqs,
            config,
            queue_name,
            queue_url,
            queue_arn,
            dlq_url: OnceCell::new(),
            topic_arns: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SnsSqsConfig {
        &self.config
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// URL of the dead-letter queue, creating it on first use.
    pub async fn dlq_url(&self) -> Result<&str> {
        let url = self
            .dlq_url
            .get_or_try_init(|| async {
                create_queue(
                    &self.sqs,
                    &self.config.dlq_queue_name(),
                    self.config.visibility_timeout_secs,
                )
                .await
            })
            .await?;
        Ok(url.as_str())
    }

    /// Get or create an SNS topic ARN for an event type.
    async fn get_or_create_topic(&self, event_type_name: &str) -> Result<String> {
        let topic_name = self.config.topic_for_event_type(event_type_name)?;

        // Check cache
        {
            let arns = self.topic_arns.read().await;
            if let Some(arn) = arns.get(&topic_name) {
                return Ok(arn.clone());
            }
        }

        // Create topic (idempotent - returns existing if already exists)
        let result = self
            .sns
            .create_topic()
            .name(&topic_name)
            .send()
            .await
            .map_err(|e| provisioning_call("Failed to create SNS topic", e))?;

        let arn = result
            .topic_arn()
            .ok_or_else(|| BusError::Provisioning("SNS create_topic returned no ARN".to_string()))?
            .to_string();

        self.topic_arns
            .write()
            .await
            .insert(topic_name.clone(), arn.clone());

        info!(topic = %topic_name, arn = %arn, "Created/found SNS topic");
        Ok(arn)
    }

    /// Look up an existing topic ARN without creating it.
    async fn find_topic(&self, event_type_name: &str) -> Result<Option<String>> {
        let topic_name = self.config.topic_for_event_type(event_type_name)?;

        if let Some(arn) = self.topic_arns.read().await.get(&topic_name) {
            return Ok(Some(arn.clone()));
        }

        let suffix = format!(":{}", topic_name);
        let mut next_token: Option<String> = None;
        loop {
            let page = self
                .sns
                .list_topics()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| unavailable("Failed to list SNS topics", e))?;

            let found = page
                .topics()
                .iter()
                .filter_map(|t| t.topic_arn())
                .find(|arn| arn.ends_with(&suffix));
            if let Some(arn) = found {
                let arn = arn.to_string();
                self.topic_arns.write().await.insert(topic_name, arn.clone());
                return Ok(Some(arn));
            }

            match page.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(None),
            }
        }
    }

    /// Find an existing subscription of this queue to a topic.
    async fn find_subscription(&self, topic_arn: &str) -> Result<Option<String>> {
        let mut next_token: Option<String> = None;
        loop {
            let page = self
                .sns
                .list_subscriptions_by_topic()
                .topic_arn(topic_arn)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| unavailable("Failed to list SNS subscriptions", e))?;

            let found = page
                .subscriptions()
                .iter()
                .find(|s| s.endpoint() == Some(self.queue_arn.as_str()))
                .and_then(|s| s.subscription_arn());
            if let Some(arn) = found {
                return Ok(Some(arn.to_string()));
            }

            match page.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(None),
            }
        }
    }

    async fn unsubscribe(&self, subscription_arn: &str) -> Result<()> {
        self.sns
            .unsubscribe()
            .subscription_arn(subscription_arn)
            .send()
            .await
            .map_err(|e| unavailable("Failed to unsubscribe queue from topic", e))?;
        Ok(())
    }

    async fn delete(&self, delivery: &Delivery) -> Result<()> {
        self.sqs
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&delivery.receipt)
            .send()
            .await
            .map_err(|e| unavailable("Failed to delete SQS message", e))?;
        Ok(())
    }
}

/// Create an SQS queue (idempotent) and return its URL.
async fn create_queue(sqs: &SqsClient, queue_name: &str, visibility_timeout_secs: i32) -> Result<String> {
    let result = sqs
        .create_queue()
        .queue_name(queue_name)
        .attributes(
            QueueAttributeName::VisibilityTimeout,
            visibility_timeout_secs.to_string(),
        )
        .send()
        .await
        .map_err(|e| provisioning_call("Failed to create SQS queue", e))?;

    let url = result
        .queue_url()
        .ok_or_else(|| BusError::Provisioning("SQS create_queue returned no URL".to_string()))?
        .to_string();

    info!(queue = %queue_name, url = %url, "Created/found SQS queue");
    Ok(url)
}

async fn queue_arn(sqs: &SqsClient, queue_url: &str) -> Result<String> {
    let queue_attrs = sqs
        .get_queue_attributes()
        .queue_url(queue_url)
        .attribute_names(QueueAttributeName::QueueArn)
        .send()
        .await
        .map_err(|e| provisioning_call("Failed to get queue ARN", e))?;

    queue_attrs
        .attributes()
        .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
        .cloned()
        .ok_or_else(|| BusError::Provisioning("Queue has no ARN attribute".to_string()))
}

/// Let SNS topics under the prefix deliver into the queue.
async fn allow_topic_delivery(
    sqs: &SqsClient,
    queue_url: &str,
    queue_arn: &str,
    topic_prefix: &str,
) -> Result<()> {
    let policy = json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "sns.amazonaws.com" },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {
                "ArnLike": { "aws:SourceArn": format!("arn:aws:sns:*:*:{}-*", topic_prefix) }
            }
        }]
    });

    sqs.set_queue_attributes()
        .queue_url(queue_url)
        .attributes(QueueAttributeName::Policy, policy.to_string())
        .send()
        .await
        .map_err(|e| provisioning_call("Failed to set queue policy", e))?;
    Ok(())
}

#[async_trait]
impl Transport for SnsSqsTransport {
    fn name(&self) -> &'static str {
        "sns-sqs"
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn ensure_listening(&self, event_type_name: &str) -> Result<()> {
        if self.subscriptions.read().await.contains_key(event_type_name) {
            return Ok(());
        }

        let topic_arn = self.get_or_create_topic(event_type_name).await?;

        // Subscribe is idempotent for an identical endpoint and attributes
        let result = self
            .sns
            .subscribe()
            .topic_arn(&topic_arn)
            .protocol("sqs")
            .endpoint(&self.queue_arn)
            .attributes("RawMessageDelivery", "true")
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| provisioning_call("Failed to subscribe queue to topic", e))?;

        let subscription_arn = result.subscription_arn().unwrap_or_default().to_string();
        self.subscriptions
            .write()
            .await
            .insert(event_type_name.to_string(), subscription_arn);

        info!(
            event_type = %event_type_name,
            queue = %self.queue_name,
            topic_arn = %topic_arn,
            "Subscribed queue to topic"
        );
        Ok(())
    }

    async fn stop_listening(&self, event_type_name: &str) -> Result<()> {
        let cached = self.subscriptions.write().await.remove(event_type_name);
        let subscription_arn = match cached {
            Some(arn) if !arn.is_empty() => Some(arn),
            _ => match self.find_topic(event_type_name).await? {
                Some(topic_arn) => self.find_subscription(&topic_arn).await?,
                None => None,
            },
        };

        if let Some(arn) = subscription_arn {
            self.unsubscribe(&arn).await?;
            info!(event_type = %event_type_name, queue = %self.queue_name, "Unsubscribed queue from topic");
        }
        Ok(())
    }

    async fn send(&self, envelope: &EventEnvelope) -> Result<()> {
        let event_type = envelope.event_type_name();
        let topic_arn = if self.config.auto_provision_topics {
            self.get_or_create_topic(event_type).await?
        } else {
            self.find_topic(event_type)
                .await?
                .ok_or_else(|| BusError::TopicNotFound(event_type.to_string()))?
        };

        let message = serde_json::to_string(envelope).map_err(EnvelopeError::Serialize)?;

        use aws_sdk_sns::types::MessageAttributeValue;
        let event_type_attr = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(event_type)
            .build()
            .map_err(|e| provisioning("Failed to build attribute", e))?;

        self.sns
            .publish()
            .topic_arn(&topic_arn)
            .message(message)
            .message_attributes(EVENT_TYPE_ATTR, event_type_attr)
            .send()
            .await
            .map_err(|e| unavailable("Failed to publish to SNS", e))?;

        debug!(
            event_type = %event_type,
            envelope_id = %envelope.id(),
            topic_arn = %topic_arn,
            "Published envelope to SNS"
        );
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, SQS_MAX_BATCH) as i32)
            .wait_time_seconds(self.config.wait_time_secs)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| unavailable("Failed to receive messages from SQS", e))?;

        let mut deliveries = Vec::new();
        for message in output.messages() {
            let Some(receipt) = message.receipt_handle() else {
                warn!(message_id = ?message.message_id(), "SQS message without receipt handle");
                continue;
            };

            let receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);

            deliveries.push(Delivery {
                message_id: message.message_id().unwrap_or_default().to_string(),
                receipt: receipt.to_string(),
                body: message.body().unwrap_or_default().as_bytes().to_vec(),
                receive_count,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.delete(delivery).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let secs = delay.as_secs().min(SQS_MAX_VISIBILITY_SECS) as i32;
        self.sqs
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&delivery.receipt)
            .visibility_timeout(secs)
            .send()
            .await
            .map_err(|e| unavailable("Failed to change message visibility", e))?;

        debug!(message_id = %delivery.message_id, delay_secs = secs, "Message returned to queue");
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, dead_letter: DeadLetter) -> Result<()> {
        let dlq_url = self.dlq_url().await?;
        let body = dead_letter.to_json().map_err(EnvelopeError::Serialize)?;

        use aws_sdk_sqs::types::MessageAttributeValue;
        let reason_attr = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(dead_letter.reason.to_string())
            .build()
            .map_err(|e| provisioning("Failed to build attribute", e))?;

        self.sqs
            .send_message()
            .queue_url(dlq_url)
            .message_body(body)
            .message_attributes(DLQ_REASON_ATTR, reason_attr)
            .send()
            .await
            .map_err(|e| unavailable("Failed to send to DLQ", e))?;

        self.delete(delivery).await?;

        info!(
            message_id = %delivery.message_id,
            reason = %dead_letter.reason,
            attempts = dead_letter.attempts,
            queue = %self.config.dlq_queue_name(),
            "Message sent to DLQ queue"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.config.release_subscriptions_on_stop {
            return Ok(());
        }

        let subscriptions: Vec<(String, String)> =
            self.subscriptions.write().await.drain().collect();
        for (event_type, arn) in subscriptions {
            if arn.is_empty() {
                continue;
            }
            if let Err(e) = self.unsubscribe(&arn).await {
                warn!(event_type = %event_type, error = %e, "Failed to release subscription");
            }
        }

        info!(queue = %self.queue_name, "SNS/SQS transport released subscriptions");
        Ok(())
    }
}
