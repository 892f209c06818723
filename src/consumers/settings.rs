use serde::Deserialize;
use std::time::Duration;

/// Consumer options that usually come from configuration files.
///
/// Every field is optional: unset fields leave the [`ConsumerDescriptor`] untouched when
/// applied with [`ConsumerDescriptor::apply_settings`].
///
/// [`ConsumerDescriptor`]: crate::consumers::ConsumerDescriptor
/// [`ConsumerDescriptor::apply_settings`]: crate::consumers::ConsumerDescriptor::apply_settings
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSettings {
    #[serde(default)]
    pub prefetch_count: Option<u16>,
    /// How many deliveries are processed at the same time. `1` keeps the queue order.
    #[serde(default)]
    pub dispatch_concurrency: Option<usize>,
    #[serde(default)]
    pub exclusive: Option<bool>,
    #[serde(default)]
    pub consumer_tag: Option<String>,
    /// See <https://www.rabbitmq.com/consumer-priority.html>.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub queue_check: Option<QueueCheckRetry>,
}

/// How long to wait for the consumer's queue to show up.
///
/// The queue is checked with a passive declare, retried with exponential backoff: the
/// first retry waits `initial_delay_ms`, every following one twice as long, capped at
/// `max_delay_ms`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCheckRetry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for QueueCheckRetry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl QueueCheckRetry {
    /// The delay before retry number `retry` (starting at 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}
