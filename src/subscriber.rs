//! Subscriber: topology setup, consume loop, acknowledgement policy, and
//! channel self-healing.
//!
//! ## Lifecycle
//!
//! `Stopped → Initializing → Consuming`, with `Reinitializing` entered
//! automatically whenever the consume stream dies underneath us, and
//! `Stopped` reached again via [`Subscriber::stop`].
//!
//! ## Acknowledgement policy
//!
//! Deliveries are settled one at a time, in broker order:
//!
//! - envelope decodes and the consumer succeeds → single ack;
//! - consumer fails on a first delivery → nack with requeue, the broker
//!   redelivers immediately with the redelivered flag set;
//! - consumer fails on a redelivery → reject without requeue, the queue's
//!   dead-letter arguments route the message to the dead-letter queue;
//! - the envelope itself does not decode → reject without requeue; a body
//!   that never parses cannot become parseable through retries.
//!
//! ## Self-healing
//!
//! A channel fault (the delivery stream ending while not stopping) tears the
//! channel down and, after a short pause, recreates it, re-declares the full
//! topology, and resumes consuming. No operator action is required.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::BusConfig;
use crate::domain::{
    //
    ChannelPtr,
    ConnectionPtr,
    ConsumerPtr,
    DeadLetter,
    Delivery,
    Envelope,
    QueueOptions,
    Topology,
};
use crate::{codec, log_error, log_info, log_warn, Error, Result};

/// Observable lifecycle state of a [`Subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    // ---
    Stopped,
    Initializing,
    Consuming,
    Reinitializing,
}

impl SubscriberState {
    fn from_u8(value: u8) -> Self {
        // ---
        match value {
            1 => Self::Initializing,
            2 => Self::Consuming,
            3 => Self::Reinitializing,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        // ---
        match self {
            Self::Stopped => 0,
            Self::Initializing => 1,
            Self::Consuming => 2,
            Self::Reinitializing => 3,
        }
    }
}

/// Consumes a work queue and settles every delivery.
///
/// One subscriber owns one channel over the shared connection and runs one
/// consume task. The next delivery is not taken until the current one has
/// been acked, nacked, or rejected, so stopping never abandons in-flight
/// work.
pub struct Subscriber {
    // ---
    inner: Arc<Inner>,
    control: Mutex<Option<Control>>,
}

struct Control {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    connection: ConnectionPtr,
    topology: Topology,
    consumer_tag: String,
    prefetch: u16,
    reinit_delay: Duration,
    state: AtomicU8,
}

/// Acquire mutex guard, ignoring poisoning.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Subscriber {
    pub fn new(connection: ConnectionPtr, config: &BusConfig) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                connection,
                topology: config.topology(),
                consumer_tag: config.consumer_tag.clone(),
                prefetch: config.prefetch,
                reinit_delay: config.reinit_delay,
                state: AtomicU8::new(SubscriberState::Stopped.as_u8()),
            }),
            control: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// The topology this subscriber declares and consumes.
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Register the downstream consumer and start consuming.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`] if the subscriber is already started.
    /// Broker-side setup failures do not fail `start`; the consume task
    /// keeps retrying initialization until stopped.
    pub fn start(&self, consumer: ConsumerPtr) -> Result<()> {
        // ---
        let mut control = lock_ignore_poison(&self.control);

        if control.is_some() {
            return Err(Error::Broker("subscriber already started".to_owned()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.set_state(SubscriberState::Initializing);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner.run(consumer, shutdown_rx).await;
        });

        *control = Some(Control {
            shutdown: shutdown_tx,
            task,
        });

        Ok(())
    }

    /// Unregister the consumer, finish the in-flight delivery, close the
    /// channel, and return to `Stopped`. Idempotent.
    pub async fn stop(&self) {
        // ---
        let control = {
            let mut guard = lock_ignore_poison(&self.control);
            guard.take()
        };

        if let Some(control) = control {
            let _ = control.shutdown.send(true);
            let _ = control.task.await;
        }
    }
}

impl Inner {
    fn set_state(&self, state: SubscriberState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>, consumer: ConsumerPtr, mut shutdown: watch::Receiver<bool>) {
        // ---
        let mut recovering = false;

        'lifecycle: loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(if recovering {
                SubscriberState::Reinitializing
            } else {
                SubscriberState::Initializing
            });
            recovering = true;

            let (channel, mut deliveries) = match self.open_and_setup().await {
                Ok(ready) => ready,
                Err(err) => {
                    log_error!(
                        "failed to initialize consumer on queue '{}': {}",
                        self.topology.queue,
                        err
                    );
                    if wait_or_shutdown(&mut shutdown, self.reinit_delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(SubscriberState::Consuming);
            log_info!(
                "consuming queue '{}' bound to exchange '{}'",
                self.topology.queue,
                self.topology.exchange
            );

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = channel.close().await;
                        break 'lifecycle;
                    }
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => {
                            self.handle_delivery(&channel, &consumer, delivery).await;
                        }
                        None => {
                            log_warn!(
                                "channel fault on queue '{}', rebuilding channel and topology",
                                self.topology.queue
                            );
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }
            }

            if wait_or_shutdown(&mut shutdown, self.reinit_delay).await {
                break;
            }
        }

        self.set_state(SubscriberState::Stopped);
        log_info!("subscriber for queue '{}' stopped", self.topology.queue);
    }

    async fn open_and_setup(&self) -> Result<(ChannelPtr, mpsc::UnboundedReceiver<Delivery>)> {
        // ---
        let channel = self.connection.create_channel().await?;
        self.declare_topology(&channel).await?;
        channel.set_prefetch(self.prefetch).await?;

        let deliveries = channel
            .consume(&self.topology.queue, &self.consumer_tag)
            .await?;

        Ok((channel, deliveries))
    }

    // Dead-letter side first, so the main queue's arguments reference
    // entities that already exist.
    async fn declare_topology(&self, channel: &ChannelPtr) -> Result<()> {
        // ---
        let t = &self.topology;

        channel.declare_exchange(&t.dead_letter_exchange).await?;
        channel
            .declare_queue(
                &t.dead_letter_queue,
                QueueOptions {
                    durable: true,
                    auto_delete: false,
                    dead_letter: None,
                },
            )
            .await?;
        channel
            .bind_queue(&t.dead_letter_queue, &t.dead_letter_exchange)
            .await?;

        channel.declare_exchange(&t.exchange).await?;
        channel
            .declare_queue(
                &t.queue,
                QueueOptions {
                    durable: false,
                    auto_delete: true,
                    dead_letter: Some(DeadLetter {
                        exchange: t.dead_letter_exchange.clone(),
                        routing_key: t.exchange.clone(),
                    }),
                },
            )
            .await?;
        channel.bind_queue(&t.queue, &t.exchange).await?;

        Ok(())
    }

    async fn handle_delivery(
        &self,
        channel: &ChannelPtr,
        consumer: &ConsumerPtr,
        delivery: Delivery,
    ) {
        // ---
        let envelope = match codec::decode::<Envelope>(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                // A body that never parses cannot be retried into parsing;
                // park it in the dead-letter queue where it is observable.
                log_error!(
                    "could not decode delivery from queue '{}', rejecting to dead letter: {}",
                    self.topology.queue,
                    err
                );
                if let Err(err) = channel.reject(delivery.tag).await {
                    log_error!("failed to reject undecodable delivery: {}", err);
                }
                return;
            }
        };

        let id = envelope.id;
        let message_type = envelope.message_type.clone();

        let settled = match consumer.on_envelope(envelope).await {
            Ok(()) => channel.ack(delivery.tag).await,
            Err(err) if !delivery.redelivered => {
                log_warn!(
                    "error processing message '{}' with type '{}': {}. Nacking...",
                    id,
                    message_type,
                    err
                );
                channel.nack_requeue(delivery.tag).await
            }
            Err(err) => {
                log_warn!(
                    "fatal error processing message '{}' with type '{}': {}. Rejecting...",
                    id,
                    message_type,
                    err
                );
                channel.reject(delivery.tag).await
            }
        };

        if let Err(err) = settled {
            log_error!("failed to settle delivery for message '{}': {}", id, err);
        }
    }
}

// True means shutdown was requested during the wait.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    // ---
    if *shutdown.borrow() {
        return true;
    }

    tokio::select! {
        _ = shutdown.changed() => true,
        _ = sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::create_memory_bus;

    struct NoopConsumer;

    #[async_trait::async_trait]
    impl crate::domain::EnvelopeConsumer for NoopConsumer {
        async fn on_envelope(&self, _envelope: Envelope) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        // ---
        let (connection, _broker) = create_memory_bus();
        let config = BusConfig::new("memory://", "requests");
        let subscriber = Subscriber::new(connection, &config);

        subscriber.start(Arc::new(NoopConsumer)).unwrap();
        assert!(matches!(
            subscriber.start(Arc::new(NoopConsumer)),
            Err(Error::Broker(_))
        ));

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restartable() {
        // ---
        let (connection, _broker) = create_memory_bus();
        let config = BusConfig::new("memory://", "requests");
        let subscriber = Subscriber::new(connection, &config);
        assert_eq!(subscriber.state(), SubscriberState::Stopped);

        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);

        subscriber.start(Arc::new(NoopConsumer)).unwrap();
        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);

        subscriber.start(Arc::new(NoopConsumer)).unwrap();
        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
    }
}
