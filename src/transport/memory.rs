// src/transport/memory.rs

//! In-memory bus implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! [`BusConnection`]/[`BusChannel`] seam using in-process data structures
//! only.
//!
//! The memory bus is the **reference implementation** of the seam's
//! semantics. Other transports are expected to approximate this behavior as
//! closely as their underlying brokers allow:
//!
//! - fanout exchanges copy each publish to every bound queue;
//! - deliveries are settled per tag, never cumulatively;
//! - nack-with-requeue re-presents the message immediately with the
//!   redelivered flag set;
//! - reject routes the message to the queue's dead-letter exchange;
//! - losing a channel requeues its unsettled deliveries with the
//!   redelivered flag set;
//! - queue backlogs survive the loss of their consumer.
//!
//! ## Non-goals
//!
//! - Persistence, durability, and auto-delete semantics (declaration flags
//!   are accepted and ignored, so recovery behavior stays deterministic in
//!   tests).
//! - Network behavior or timing variability.
//!
//! The broker keeps settlement counters and exposes queue introspection so
//! tests can assert the acknowledgement properties directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::{
    //
    BusChannel,
    BusConnection,
    ChannelPtr,
    ConnectionPtr,
    Delivery,
    QueueOptions,
};
use crate::{log_debug, Error, Result};

/// Create a connected in-memory bus.
///
/// Returns the connection to hand to publishers/subscribers and the broker
/// handle used by tests for fault injection and queue inspection.
pub fn create_memory_bus() -> (ConnectionPtr, Arc<MemoryBroker>) {
    // ---
    let broker = Arc::new(MemoryBroker::new());
    let connection = Arc::new(MemoryConnection {
        broker: Arc::clone(&broker),
    });

    (connection, broker)
}

/// Settlement totals since the broker was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerCounters {
    pub publishes: u64,
    pub acks: u64,
    pub nacks: u64,
    pub rejects: u64,
}

#[derive(Clone)]
struct QueuedMessage {
    body: Bytes,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Queue {
    backlog: VecDeque<QueuedMessage>,
    dead_letter_exchange: Option<String>,
    consumer: Option<ConsumerSlot>,
}

#[derive(Default)]
struct Exchange {
    bindings: Vec<String>,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
}

/// In-process broker.
pub struct MemoryBroker {
    // ---
    state: Mutex<BrokerState>,
    publishes: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    rejects: AtomicU64,
    next_tag: AtomicU64,
    next_channel_id: AtomicU64,
}

/// Acquire mutex guard, ignoring poisoning.
fn lock_state(m: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        // ---
        Self {
            state: Mutex::new(BrokerState::default()),
            publishes: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
            next_tag: AtomicU64::new(0),
            next_channel_id: AtomicU64::new(0),
        }
    }

    /// Settlement totals so far.
    pub fn counters(&self) -> BrokerCounters {
        // ---
        BrokerCounters {
            publishes: self.publishes.load(Ordering::SeqCst),
            acks: self.acks.load(Ordering::SeqCst),
            nacks: self.nacks.load(Ordering::SeqCst),
            rejects: self.rejects.load(Ordering::SeqCst),
        }
    }

    /// Number of messages sitting in a queue's backlog (unsettled in-flight
    /// deliveries not included). Zero for unknown queues.
    pub fn queue_depth(&self, queue: &str) -> usize {
        // ---
        lock_state(&self.state)
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    /// Pop and return every message currently in a queue's backlog.
    pub fn drain_queue(&self, queue: &str) -> Vec<Bytes> {
        // ---
        let mut state = lock_state(&self.state);
        match state.queues.get_mut(queue) {
            Some(queue) => queue.backlog.drain(..).map(|m| m.body).collect(),
            None => Vec::new(),
        }
    }

    /// Simulate a broker-side channel fault: every consumer is cut off and
    /// every unsettled delivery is requeued with the redelivered flag set.
    pub fn inject_fault(&self) {
        // ---
        let mut state = lock_state(&self.state);

        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }

        let unacked: Vec<Unacked> = state.unacked.drain().map(|(_, u)| u).collect();
        for mut unacked in unacked {
            unacked.message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.backlog.push_front(unacked.message);
            }
        }
    }

    fn declare_exchange(&self, name: &str) {
        // ---
        lock_state(&self.state)
            .exchanges
            .entry(name.to_owned())
            .or_default();
    }

    fn declare_queue(&self, name: &str, options: QueueOptions) {
        // ---
        let mut state = lock_state(&self.state);
        let queue = state.queues.entry(name.to_owned()).or_default();
        queue.dead_letter_exchange = options.dead_letter.map(|d| d.exchange);
    }

    fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        // ---
        let mut state = lock_state(&self.state);

        if !state.queues.contains_key(queue) {
            return Err(Error::Broker(format!("unknown queue '{queue}'")));
        }

        let entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::Broker(format!("unknown exchange '{exchange}'")))?;

        if !entry.bindings.iter().any(|bound| bound == queue) {
            entry.bindings.push(queue.to_owned());
        }

        Ok(())
    }

    fn publish(&self, exchange: &str, body: &[u8]) -> Result<()> {
        // ---
        let mut state = lock_state(&self.state);

        let bindings = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::Broker(format!("unknown exchange '{exchange}'")))?
            .bindings
            .clone();

        self.publishes.fetch_add(1, Ordering::SeqCst);

        let body = Bytes::copy_from_slice(body);
        for queue_name in bindings {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.backlog.push_back(QueuedMessage {
                    body: body.clone(),
                    redelivered: false,
                });
            }
            self.flush(&mut state, &queue_name);
        }

        Ok(())
    }

    fn consume(
        &self,
        channel_id: u64,
        queue_name: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = lock_state(&self.state);
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::Broker(format!("unknown queue '{queue_name}'")))?;

        queue.consumer = Some(ConsumerSlot { channel_id, tx });
        self.flush(&mut state, queue_name);

        Ok(rx)
    }

    fn ack(&self, tag: u64) {
        // ---
        if lock_state(&self.state).unacked.remove(&tag).is_some() {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn nack_requeue(&self, tag: u64) {
        // ---
        let mut state = lock_state(&self.state);

        if let Some(mut unacked) = state.unacked.remove(&tag) {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            unacked.message.redelivered = true;

            let queue_name = unacked.queue.clone();
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.backlog.push_front(unacked.message);
            }
            self.flush(&mut state, &queue_name);
        }
    }

    fn reject(&self, tag: u64) {
        // ---
        let mut state = lock_state(&self.state);

        if let Some(unacked) = state.unacked.remove(&tag) {
            self.rejects.fetch_add(1, Ordering::SeqCst);

            let dead_letter = state
                .queues
                .get(&unacked.queue)
                .and_then(|q| q.dead_letter_exchange.clone());

            match dead_letter {
                Some(exchange) => {
                    let bindings = state
                        .exchanges
                        .get(&exchange)
                        .map(|e| e.bindings.clone())
                        .unwrap_or_default();

                    for queue_name in bindings {
                        if let Some(queue) = state.queues.get_mut(&queue_name) {
                            queue.backlog.push_back(QueuedMessage {
                                body: unacked.message.body.clone(),
                                redelivered: false,
                            });
                        }
                        self.flush(&mut state, &queue_name);
                    }
                }
                None => {
                    log_debug!(
                        "rejected delivery {} discarded (no dead-letter exchange)",
                        tag
                    );
                }
            }
        }
    }

    fn channel_closed(&self, channel_id: u64) {
        // ---
        let mut state = lock_state(&self.state);

        for queue in state.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|slot| slot.channel_id == channel_id)
            {
                queue.consumer = None;
            }
        }

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags {
            if let Some(mut unacked) = state.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.backlog.push_front(unacked.message);
                }
            }
        }
    }

    // Hand backlog messages to the queue's consumer, if any.
    fn flush(&self, state: &mut BrokerState, queue_name: &str) {
        // ---
        loop {
            let queue = match state.queues.get_mut(queue_name) {
                Some(queue) => queue,
                None => return,
            };

            let message = match queue.backlog.pop_front() {
                Some(message) => message,
                None => return,
            };

            let (tx, channel_id) = match queue.consumer.as_ref() {
                Some(slot) => (slot.tx.clone(), slot.channel_id),
                None => {
                    queue.backlog.push_front(message);
                    return;
                }
            };

            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                body: message.body.clone(),
                redelivered: message.redelivered,
                tag,
            };

            if tx.send(delivery).is_err() {
                // Receiver gone; the consumer is dead.
                queue.backlog.push_front(message);
                queue.consumer = None;
                return;
            }

            state.unacked.insert(
                tag,
                Unacked {
                    channel_id,
                    queue: queue_name.to_owned(),
                    message,
                },
            );
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
}

#[async_trait::async_trait]
impl BusConnection for MemoryConnection {
    // ---
    async fn create_channel(&self) -> Result<ChannelPtr> {
        let id = self.broker.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Arc::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            id,
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    id: u64,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Broker("channel is closed".to_owned()))
        }
    }
}

#[async_trait::async_trait]
impl BusChannel for MemoryChannel {
    // ---
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_exchange(name);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_queue(name, options);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.bind_queue(queue, exchange)
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        // Delivery pacing is the subscriber's concern in-process.
        self.ensure_open()
    }

    async fn publish(&self, exchange: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.broker.publish(exchange, body)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        self.ensure_open()?;
        self.broker.consume(self.id, queue)
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.broker.ack(tag);
        Ok(())
    }

    async fn nack_requeue(&self, tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.broker.nack_requeue(tag);
        Ok(())
    }

    async fn reject(&self, tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.broker.reject(tag);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.channel_closed(self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::domain::DeadLetter;

    async fn declare_work_queue(channel: &ChannelPtr) {
        // ---
        channel.declare_exchange("dlx").await.unwrap();
        channel
            .declare_queue("dead", QueueOptions::default())
            .await
            .unwrap();
        channel.bind_queue("dead", "dlx").await.unwrap();

        channel.declare_exchange("work").await.unwrap();
        channel
            .declare_queue(
                "jobs",
                QueueOptions {
                    durable: false,
                    auto_delete: true,
                    dead_letter: Some(DeadLetter {
                        exchange: "dlx".to_owned(),
                        routing_key: "work".to_owned(),
                    }),
                },
            )
            .await
            .unwrap();
        channel.bind_queue("jobs", "work").await.unwrap();
    }

    #[tokio::test]
    async fn nack_redelivers_with_the_flag_set() {
        // ---
        let (connection, _broker) = create_memory_bus();
        let channel = connection.create_channel().await.unwrap();
        declare_work_queue(&channel).await;

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        channel.publish("work", b"payload").await.unwrap();

        let first = deliveries.recv().await.unwrap();
        assert!(!first.redelivered);

        channel.nack_requeue(first.tag).await.unwrap();

        let second = deliveries.recv().await.unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, first.body);
    }

    #[tokio::test]
    async fn reject_routes_to_the_dead_letter_queue() {
        // ---
        let (connection, broker) = create_memory_bus();
        let channel = connection.create_channel().await.unwrap();
        declare_work_queue(&channel).await;

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        channel.publish("work", b"payload").await.unwrap();

        let delivery = deliveries.recv().await.unwrap();
        channel.reject(delivery.tag).await.unwrap();

        assert_eq!(broker.queue_depth("dead"), 1);
        assert_eq!(
            broker.drain_queue("dead"),
            vec![Bytes::from_static(b"payload")]
        );
    }

    #[tokio::test]
    async fn backlog_survives_consumer_loss() {
        // ---
        let (connection, broker) = create_memory_bus();
        let channel = connection.create_channel().await.unwrap();
        declare_work_queue(&channel).await;

        channel.publish("work", b"one").await.unwrap();
        channel.publish("work", b"two").await.unwrap();
        assert_eq!(broker.queue_depth("jobs"), 2);

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        assert_eq!(
            deliveries.recv().await.unwrap().body,
            Bytes::from_static(b"one")
        );
        assert_eq!(
            deliveries.recv().await.unwrap().body,
            Bytes::from_static(b"two")
        );
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_its_unsettled_deliveries() {
        // ---
        let (connection, broker) = create_memory_bus();
        let channel = connection.create_channel().await.unwrap();
        declare_work_queue(&channel).await;

        let mut deliveries = channel.consume("jobs", "t").await.unwrap();
        channel.publish("work", b"payload").await.unwrap();
        let _taken = deliveries.recv().await.unwrap();

        channel.close().await.unwrap();
        assert_eq!(broker.queue_depth("jobs"), 1);

        let replacement = connection.create_channel().await.unwrap();
        let mut deliveries = replacement.consume("jobs", "t").await.unwrap();
        assert!(deliveries.recv().await.unwrap().redelivered);
    }
}
