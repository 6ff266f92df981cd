//! Backoff builders for transport retries and message redelivery.
//!
//! Uses `backon` for exponential backoff. Publish and receive-loop backoffs
//! are jittered; the redelivery schedule is deterministic so the visibility
//! delay of attempt N is predictable.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Backoff for retrying a publish while the broker is unreachable.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 10 (the publish timeout usually fires first)
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(10)
        .with_jitter()
}

/// Backoff for the receive loop while the broker is unreachable.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unlimited attempts; the loop only ends on shutdown
/// - Jitter enabled
pub fn receive_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Visibility delay before redelivering a message that failed `retries + 1`
/// times: `base * 2^retries`, capped at `max`.
pub fn redelivery_delay(base: Duration, max: Duration, retries: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    ExponentialBuilder::default()
        .with_min_delay(base)
        .with_max_delay(max)
        .without_max_times()
        .build()
        .nth(retries as usize)
        .unwrap_or(max)
}
