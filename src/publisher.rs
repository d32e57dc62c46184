//! Reliable publisher.
//!
//! Turns an envelope into a persistent broker publish with a bounded,
//! exponentially backed-off retry loop. The retry loop is deliberately a
//! small explicit state machine (attempt counter + delay schedule) rather
//! than a policy object from a retry library.

use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::{BusConfig, RetryConfig};
use crate::domain::{ChannelPtr, ConnectionPtr, Envelope};
use crate::{codec, log_info, log_warn, Error, Result};

/// Publishes envelopes to a fanout exchange.
///
/// The publisher owns exactly one channel over the shared connection. The
/// channel is opened lazily on first publish, the exchange is declared once
/// per channel, and a failed send drops the channel so the next attempt
/// starts from a fresh one.
pub struct Publisher {
    // ---
    connection: ConnectionPtr,
    exchange: String,
    retry: RetryConfig,
    channel: Mutex<Option<ChannelPtr>>,
}

impl Publisher {
    pub fn new(connection: ConnectionPtr, config: &BusConfig) -> Self {
        // ---
        Self {
            connection,
            exchange: config.exchange.clone(),
            retry: config.retry.clone(),
            channel: Mutex::new(None),
        }
    }

    /// Deliver an envelope to the broker, retrying transient failures.
    ///
    /// Exactly one network publish happens per successful attempt. Each
    /// retry waits `initial_delay * multiplier^n` (2s, 4s, 8s by default)
    /// and is logged with the failing cause.
    ///
    /// # Errors
    ///
    /// [`Error::Encode`] if the envelope cannot be encoded; terminal
    /// [`Error::Publish`] once the retry budget is exhausted. A terminal
    /// failure must surface to the caller as a failed submission; it is not
    /// retried further upstream.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        // ---
        let body = codec::encode(envelope)?;

        let mut attempt: u32 = 0;
        loop {
            match self.try_publish(&body).await {
                Ok(()) => {
                    log_info!(
                        "message '{}' with type '{}' published to exchange '{}'",
                        envelope.id,
                        envelope.message_type,
                        self.exchange
                    );
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;

                    if attempt > self.retry.max_attempts {
                        return Err(Error::Publish {
                            exchange: self.exchange.clone(),
                            attempts: attempt,
                            cause: err.to_string(),
                        });
                    }

                    let delay = self.retry.delay_for(attempt);
                    log_warn!(
                        "could not publish message '{}' to exchange '{}' \
                         (attempt {}/{}), retrying in {:?}: {}",
                        envelope.id,
                        self.exchange,
                        attempt,
                        self.retry.max_attempts,
                        delay,
                        err
                    );

                    // The channel may be the casualty; rebuild it next attempt.
                    self.channel.lock().await.take();

                    sleep(delay).await;
                }
            }
        }
    }

    async fn try_publish(&self, body: &[u8]) -> Result<()> {
        // ---
        let channel = self.ensure_channel().await?;
        channel.publish(&self.exchange, body).await
    }

    // Opens the channel and declares the exchange once; later publishes on
    // the same channel skip the declaration.
    async fn ensure_channel(&self) -> Result<ChannelPtr> {
        // ---
        let mut guard = self.channel.lock().await;

        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }

        let channel = self.connection.create_channel().await?;
        channel.declare_exchange(&self.exchange).await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::domain::{BusChannel, BusConnection, Delivery, QueueOptions};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    // Channel double that fails the first `failures_left` publishes.
    struct ScriptedChannel {
        failures_left: Arc<AtomicU32>,
        sends: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl BusChannel for ScriptedChannel {
        async fn declare_exchange(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn declare_queue(&self, _name: &str, _options: QueueOptions) -> Result<()> {
            Ok(())
        }

        async fn bind_queue(&self, _queue: &str, _exchange: &str) -> Result<()> {
            Ok(())
        }

        async fn set_prefetch(&self, _count: u16) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, _exchange: &str, _body: &[u8]) -> Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);

            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Broker("simulated send failure".to_owned()));
            }
            Ok(())
        }

        async fn consume(
            &self,
            _queue: &str,
            _consumer_tag: &str,
        ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn ack(&self, _tag: u64) -> Result<()> {
            Ok(())
        }

        async fn nack_requeue(&self, _tag: u64) -> Result<()> {
            Ok(())
        }

        async fn reject(&self, _tag: u64) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedConnection {
        failures_left: Arc<AtomicU32>,
        sends: Arc<AtomicU32>,
        channels_opened: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl BusConnection for ScriptedConnection {
        async fn create_channel(&self) -> Result<ChannelPtr> {
            self.channels_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedChannel {
                failures_left: Arc::clone(&self.failures_left),
                sends: Arc::clone(&self.sends),
            }))
        }
    }

    struct Harness {
        publisher: Publisher,
        sends: Arc<AtomicU32>,
        channels_opened: Arc<AtomicU32>,
    }

    fn harness(failures: u32) -> Harness {
        // ---
        let failures_left = Arc::new(AtomicU32::new(failures));
        let sends = Arc::new(AtomicU32::new(0));
        let channels_opened = Arc::new(AtomicU32::new(0));

        let connection = Arc::new(ScriptedConnection {
            failures_left,
            sends: Arc::clone(&sends),
            channels_opened: Arc::clone(&channels_opened),
        });

        let config = BusConfig::new("amqp://unused", "requests");
        let publisher = Publisher::new(connection, &config);

        Harness {
            publisher,
            sends,
            channels_opened,
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(Uuid::new_v4(), "tests.Job", Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn publishes_once_on_success() {
        // ---
        let h = harness(0);

        h.publisher.publish(&envelope()).await.unwrap();

        assert_eq!(h.sends.load(Ordering::SeqCst), 1);
        assert_eq!(h.channels_opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_is_reused_across_publishes() {
        // ---
        let h = harness(0);

        h.publisher.publish(&envelope()).await.unwrap();
        h.publisher.publish(&envelope()).await.unwrap();

        assert_eq!(h.sends.load(Ordering::SeqCst), 2);
        assert_eq!(h.channels_opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_takes_three_attempts() {
        // ---
        let h = harness(2);
        let started = tokio::time::Instant::now();

        h.publisher.publish(&envelope()).await.unwrap();

        assert_eq!(h.sends.load(Ordering::SeqCst), 3);
        // 2s after the first failure, 4s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        // The dead channel is dropped after each failure.
        assert_eq!(h.channels_opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_a_terminal_error() {
        // ---
        let h = harness(u32::MAX);
        let started = tokio::time::Instant::now();

        let outcome = h.publisher.publish(&envelope()).await;

        match outcome {
            Err(Error::Publish {
                exchange, attempts, ..
            }) => {
                assert_eq!(exchange, "requests");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // Initial attempt + 3 retries, then nothing further.
        assert_eq!(h.sends.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 4 + 8));
    }
}
