// src/domain/envelope.rs

//! The transport unit and its construction.
//!
//! An [`Envelope`] carries a unit of work across the broker: a logical id, a
//! wire-level type name, and the codec-produced payload bytes. The envelope
//! itself is opaque to the transport layer; only the consuming side's type
//! registry interprets the payload.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec;
use crate::Result;

/// A payload type that can travel through the bus.
///
/// `TYPE_NAME` is the stable, fully-qualified wire name of the type. It is
/// embedded in every envelope and must match the name the consuming side
/// registered its decode target and handlers under. Renaming a type's wire
/// name is a breaking protocol change.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name, e.g. `"asyncworks.commands.ProcessIncoming"`.
    const TYPE_NAME: &'static str;
}

/// The unit of transport between publishers and consumers.
///
/// `id` identifies the logical unit of work; `message_type` selects the
/// decode target and handler list on the consuming side; `payload` is the
/// codec-encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    // ---
    /// Logical work id, caller-supplied or generated at construction.
    pub id: Uuid,

    /// Wire name of the payload's type.
    pub message_type: String,

    /// Codec-produced payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope from already-encoded payload bytes.
    pub fn new(id: Uuid, message_type: impl Into<String>, payload: Bytes) -> Self {
        // ---
        Self {
            id,
            message_type: message_type.into(),
            payload,
        }
    }
}

/// Builds envelopes from typed values.
///
/// By default every envelope gets a random id. A deterministic id source can
/// be registered per payload type, so that the envelope id equals an id the
/// caller already tracks (e.g. the command's own id); consumers can then
/// correlate broker-side observations with application records.
#[derive(Default)]
pub struct EnvelopeFactory {
    // Values are `fn(&T) -> Uuid` boxed per concrete T.
    id_sources: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EnvelopeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deterministic id source for `T`, replacing any previous one.
    pub fn register_id_source<T: Message>(&mut self, source: fn(&T) -> Uuid) {
        // ---
        self.id_sources.insert(TypeId::of::<T>(), Box::new(source));
    }

    /// Encode `value` into an envelope tagged with `T::TYPE_NAME`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Encode`] if the payload cannot be encoded.
    pub fn create<T: Message>(&self, value: &T) -> Result<Envelope> {
        // ---
        let payload = codec::encode(value)?;

        let id = self
            .id_sources
            .get(&TypeId::of::<T>())
            .and_then(|source| source.downcast_ref::<fn(&T) -> Uuid>())
            .map(|source| source(value))
            .unwrap_or_else(Uuid::new_v4);

        Ok(Envelope::new(id, T::TYPE_NAME, payload))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        id: Uuid,
        label: String,
    }

    impl Message for Ping {
        const TYPE_NAME: &'static str = "tests.Ping";
    }

    #[test]
    fn envelope_round_trips_through_the_codec() {
        // ---
        let envelope = Envelope::new(Uuid::new_v4(), "tests.Ping", Bytes::from_static(b"{}"));

        let bytes = codec::encode(&envelope).unwrap();
        let decoded: Envelope = codec::decode(&bytes).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn factory_uses_registered_id_source() {
        // ---
        let mut factory = EnvelopeFactory::new();
        factory.register_id_source::<Ping>(|ping| ping.id);

        let ping = Ping {
            id: Uuid::new_v4(),
            label: "hello".to_owned(),
        };

        let envelope = factory.create(&ping).unwrap();

        assert_eq!(envelope.id, ping.id);
        assert_eq!(envelope.message_type, Ping::TYPE_NAME);

        let decoded: Ping = codec::decode(&envelope.payload).unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn factory_generates_random_ids_without_a_source() {
        // ---
        let factory = EnvelopeFactory::new();
        let ping = Ping {
            id: Uuid::new_v4(),
            label: "hello".to_owned(),
        };

        let first = factory.create(&ping).unwrap();
        let second = factory.create(&ping).unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.id, ping.id);
    }
}
