//! Worker loop: bridges received envelopes to typed handler dispatch.
//!
//! The worker registers itself as the subscriber's downstream consumer. For
//! every envelope it resolves the wire name in the type registry, lets the
//! registry decode the payload and run the handlers, and reports the outcome
//! back for the subscriber to translate into ack, nack, or reject. An
//! unknown type and a failing handler deliberately travel the same failure
//! path.

use std::sync::Arc;

use crate::domain::{Envelope, EnvelopeConsumer};
use crate::registry::TypeRegistry;
use crate::subscriber::Subscriber;
use crate::{log_debug, log_info, Result};

/// Runs the dispatch side of the bus.
pub struct Worker {
    // ---
    subscriber: Subscriber,
    dispatcher: Arc<Dispatcher>,
}

struct Dispatcher {
    registry: Arc<TypeRegistry>,
}

#[async_trait::async_trait]
impl EnvelopeConsumer for Dispatcher {
    async fn on_envelope(&self, envelope: Envelope) -> Result<()> {
        // ---
        log_info!(
            "processing message '{}' with type '{}'...",
            envelope.id,
            envelope.message_type
        );

        let entry = self.registry.resolve(&envelope.message_type)?;
        log_debug!(
            "dispatching '{}' to {} handler(s)",
            envelope.message_type,
            entry.handler_count()
        );

        entry.dispatch(envelope.payload).await
    }
}

impl Worker {
    pub fn new(subscriber: Subscriber, registry: Arc<TypeRegistry>) -> Self {
        // ---
        Self {
            subscriber,
            dispatcher: Arc::new(Dispatcher { registry }),
        }
    }

    /// Subscribe to the bus and begin dispatching.
    pub fn start(&self) -> Result<()> {
        // ---
        log_info!("starting worker...");
        let consumer: crate::domain::ConsumerPtr = self.dispatcher.clone();
        self.subscriber.start(consumer)?;
        log_info!("worker started, consuming messages");
        Ok(())
    }

    /// Stop consuming; the in-flight dispatch (if any) completes first.
    pub async fn stop(&self) {
        // ---
        log_info!("stopping worker...");
        self.subscriber.stop().await;
        log_info!("worker stopped");
    }

    /// The underlying subscriber, for state inspection.
    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }
}
