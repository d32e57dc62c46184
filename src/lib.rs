//! Reliable at-least-once work delivery over a fanout message broker.
//!
//! This library accepts typed units of work, wraps them in envelopes,
//! publishes them with bounded exponential-backoff retry, and consumes them
//! with manual acknowledgements: a handler failure on a first delivery is
//! nacked back for one immediate redelivery, a failure on the redelivery is
//! rejected to a dead-letter queue. Handlers should be idempotent - the
//! guarantee is exactly-once-in-effect under at-least-once delivery.
//!
//! Consuming channels are self-healing: a broker-side fault tears down the
//! channel, re-declares the full topology, and resumes consuming without
//! operator action.
//!

// Import all sub modules once...
mod config;
mod domain;
mod publisher;
mod registry;
mod store;
mod subscriber;
mod transport;
mod worker;

pub mod codec;

mod error;
mod macros;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use config::{BusConfig, RetryConfig};
pub use error::{Error, Result};

pub use publisher::Publisher;
pub use registry::{Handler, TypeEntry, TypeRegistry};
pub use store::{MemoryResultStore, ProcessedResult, ResultStore, StorePtr};
pub use subscriber::{Subscriber, SubscriberState};
pub use worker::Worker;

pub use transport::{create_memory_bus, BrokerCounters, MemoryBroker};

#[cfg(feature = "amqp")]
pub use transport::create_amqp_connection;

// --- public re-exports
pub use domain::{
    //
    BusChannel,
    BusConnection,
    ChannelPtr,
    ConnectionPtr,
    ConsumerPtr,
    DeadLetter,
    Delivery,
    Envelope,
    EnvelopeConsumer,
    EnvelopeFactory,
    Message,
    QueueOptions,
    Topology,
};
