//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `BusConnection`/`BusChannel` seam. Broker-client transports are hidden
//! behind feature flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "amqp")]
mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::create_amqp_connection;

pub use memory::{create_memory_bus, BrokerCounters, MemoryBroker};
