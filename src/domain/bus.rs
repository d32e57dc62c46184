// src/domain/bus.rs

//! Bus domain abstractions.
//!
//! This module defines the domain-level seam between the delivery components
//! (publisher, subscriber) and concrete broker clients. It intentionally
//! avoids any reference to a particular client library; concrete
//! implementations live under `src/transport/`.
//!
//! Unlike a plain publish/subscribe seam, the acknowledgement surface is
//! explicit here: the subscriber's whole job is deciding between ack,
//! nack-with-requeue, and reject-to-dead-letter, so those operations are part
//! of the contract rather than hidden inside a transport.
//!
//! The in-memory transport provides the reference semantics for this seam.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::Envelope;
use crate::Result;

/// Names of the broker-side entities one subscriber depends on.
///
/// Declaring a topology is idempotent: re-declaring with identical arguments
/// is a no-op on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    // ---
    /// Fanout exchange work is published to.
    pub exchange: String,

    /// Main work queue, bound to `exchange`.
    pub queue: String,

    /// Fanout exchange rejected work is routed to.
    pub dead_letter_exchange: String,

    /// Terminal sink queue, bound to `dead_letter_exchange`.
    pub dead_letter_queue: String,
}

/// Dead-letter routing arguments attached to a queue declaration.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    // ---
    /// Exchange rejected or expired messages are re-routed to.
    pub exchange: String,

    /// Routing key used for the re-route.
    pub routing_key: String,
}

/// Options for declaring a queue at the seam.
///
/// Exclusivity is never requested; every queue this crate declares is
/// non-exclusive.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    // ---
    /// Survive broker restarts.
    pub durable: bool,

    /// Delete the queue when its last consumer disconnects.
    pub auto_delete: bool,

    /// Dead-letter routing arguments, if any.
    pub dead_letter: Option<DeadLetter>,
}

/// One message presented to a consumer, plus what is needed to settle it.
///
/// `redelivered` is set by the broker when the same message was already
/// presented once and came back via nack-with-requeue or a channel fault.
/// `tag` identifies this delivery on its channel; every ack/nack/reject
/// references exactly one tag (never cumulative).
#[derive(Debug, Clone)]
pub struct Delivery {
    // ---
    pub body: Bytes,
    pub redelivered: bool,
    pub tag: u64,
}

/// A single broker channel.
///
/// Channels are cheap to create and are replaced wholesale on fault rather
/// than repaired. All topology declarations are idempotent.
#[async_trait::async_trait]
pub trait BusChannel: Send + Sync {
    // ---

    /// Declare a fanout exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue with the given options.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Bind a queue to an exchange (empty routing key; exchanges are fanout).
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Bound the number of unacknowledged deliveries in flight on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish a persistent, mandatory message to an exchange.
    async fn publish(&self, exchange: &str, body: &[u8]) -> Result<()>;

    /// Start consuming a queue with manual acknowledgements.
    ///
    /// The returned receiver yields deliveries in broker order; the number of
    /// unsettled deliveries in flight is governed by the prefetch, not by the
    /// receiver. The channel closing the receiver without an explicit
    /// [`BusChannel::close`] call is a channel fault; callers are expected to
    /// discard this channel and create a fresh one.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>>;

    /// Acknowledge a single delivery.
    async fn ack(&self, tag: u64) -> Result<()>;

    /// Negatively acknowledge a single delivery, requeueing it for immediate
    /// redelivery with the redelivered flag set.
    async fn nack_requeue(&self, tag: u64) -> Result<()>;

    /// Reject a single delivery without requeue; the broker routes it to the
    /// queue's dead-letter exchange, if one is configured.
    async fn reject(&self, tag: u64) -> Result<()>;

    /// Close the channel. Consuming receivers end without this being treated
    /// as a fault by the broker side.
    async fn close(&self) -> Result<()>;
}

/// A shared broker connection.
///
/// One connection is shared by all publishers and subscribers of a process;
/// implementations reconnect transparently, so a `create_channel` call after
/// a connection loss establishes a fresh connection first.
#[async_trait::async_trait]
pub trait BusConnection: Send + Sync {
    // ---
    async fn create_channel(&self) -> Result<ChannelPtr>;
}

/// Downstream consumer of decoded envelopes.
///
/// The subscriber raises each successfully decoded envelope to exactly one
/// registered consumer and translates the returned outcome into an
/// acknowledgement decision.
#[async_trait::async_trait]
pub trait EnvelopeConsumer: Send + Sync {
    // ---
    async fn on_envelope(&self, envelope: Envelope) -> Result<()>;
}

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn BusChannel>;

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn BusConnection>;

/// Shared envelope-consumer pointer.
pub type ConsumerPtr = Arc<dyn EnvelopeConsumer>;
