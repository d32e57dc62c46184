//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! broker-client implementations and infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod bus;
mod envelope;

// --- Bus domain re-exports ---

pub use bus::{
    //
    BusChannel,
    BusConnection,
    ChannelPtr,
    ConnectionPtr,
    ConsumerPtr,
    DeadLetter,
    Delivery,
    EnvelopeConsumer,
    QueueOptions,
    Topology,
};

// --- Envelope re-exports ---

pub use envelope::{
    //
    Envelope,
    EnvelopeFactory,
    Message,
};
