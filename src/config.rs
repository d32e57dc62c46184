//! Public bus configuration.
//!
//! This type intentionally contains no broker-client concepts (channels,
//! consumer streams, field tables). Transport layers are responsible for
//! interpreting this config into concrete connection settings.

use std::time::Duration;

use crate::domain::Topology;

/// Retry configuration for publishing with exponential backoff.
///
/// The publisher retries a failed send `max_attempts` additional times after
/// the first failure, waiting `initial_delay * multiplier^n` between
/// attempts, capped at `max_delay`. Defaults give the 2s / 4s / 8s schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 2s
    /// - `max_delay`: 30s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay to wait before the given retry attempt (1-based).
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        // ---
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let factor = f64::from(self.multiplier.powi(exponent));
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor);
        delay.min(self.max_delay)
    }
}

/// Bus configuration and connection parameters.
///
/// Queue and dead-letter names default to values derived from the exchange
/// name; override them with the `with_*` builders where the deployment needs
/// explicit names.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker connection URI (e.g. `"amqp://localhost:5672/%2f"`).
    ///
    /// Ignored by the in-memory transport.
    pub uri: String,

    /// Fanout exchange work is published to.
    pub exchange: String,

    /// Main work queue, bound to `exchange`.
    pub queue: String,

    /// Fanout exchange terminally failed work is routed to.
    pub dead_letter_exchange: String,

    /// Durable queue bound to the dead-letter exchange.
    pub dead_letter_queue: String,

    /// Consumer tag presented to the broker.
    pub consumer_tag: String,

    /// Per-channel prefetch; bounds broker-side buffering of unacked work.
    pub prefetch: u16,

    /// Publish retry policy.
    pub retry: RetryConfig,

    /// Pause between a channel fault and the re-initialization attempt.
    pub reinit_delay: Duration,
}

impl BusConfig {
    /// Create a config for the given broker URI and exchange, deriving the
    /// queue, dead-letter, and consumer-tag names from the exchange name.
    pub fn new(uri: impl Into<String>, exchange: impl Into<String>) -> Self {
        // ---
        let exchange = exchange.into();

        Self {
            uri: uri.into(),
            queue: format!("{exchange}.work"),
            dead_letter_exchange: format!("{exchange}.dlx"),
            dead_letter_queue: format!("{exchange}.dead"),
            consumer_tag: format!("{exchange}.worker"),
            prefetch: 1,
            retry: RetryConfig::default(),
            reinit_delay: Duration::from_secs(1),
            exchange,
        }
    }

    /// Set an explicit main queue name.
    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        self.queue = name.into();
        self
    }

    /// Set explicit dead-letter exchange and queue names.
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = exchange.into();
        self.dead_letter_queue = queue.into();
        self
    }

    /// Set the consumer tag presented to the broker.
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set the per-channel prefetch count.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Configure the publish retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the pause between a channel fault and re-initialization.
    pub fn with_reinit_delay(mut self, delay: Duration) -> Self {
        self.reinit_delay = delay;
        self
    }

    /// The topology this config describes.
    pub fn topology(&self) -> Topology {
        // ---
        Topology {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
        }
    }
}
