//! Type registry: wire name → decode target + handler list.
//!
//! The consuming side supplies, at construction time, the complete set of
//! payload types it understands and the handlers to run for each. Resolution
//! is a plain map lookup on the envelope's `message_type`; there is no
//! runtime scanning of modules or reflection-style discovery.
//!
//! Dispatch decodes the payload once and invokes every handler registered
//! for the type, in registration order, awaiting each. All handlers must
//! succeed for the dispatch to succeed; the first failure is what the caller
//! sees, after the remaining handlers have still been given their turn.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec;
use crate::domain::Message;
use crate::{Error, Result};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A typed message handler.
///
/// Handlers receive the decoded value behind an `Arc` because one decode is
/// shared by every handler registered for the type. A handler must not keep
/// state across invocations that would make a redelivery observable twice;
/// see the crate docs on idempotent consumers.
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync {
    // ---
    async fn handle(&self, message: Arc<T>) -> Result<()>;
}

// Adapter so plain async closures can be registered without a named type.
struct FnHandler<T, F, Fut> {
    func: F,
    _marker: PhantomData<fn(T) -> Fut>,
}

#[async_trait::async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Arc<T>) -> Result<()> {
        // ---
        (self.func)(message).await
    }
}

// Type-erased registry entry. The typed form is recovered via `as_any_mut`
// during registration; dispatch stays fully erased.
trait DispatchEntry: Send + Sync {
    fn dispatch(&self, payload: Bytes) -> BoxFuture<'_, Result<()>>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn handler_count(&self) -> usize;
}

struct TypedEntry<T> {
    handlers: Vec<Arc<dyn Handler<T>>>,
}

impl<T: Message> DispatchEntry for TypedEntry<T> {
    // ---
    fn dispatch(&self, payload: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let message = Arc::new(codec::decode::<T>(&payload)?);

            let mut first_failure = None;
            for handler in &self.handlers {
                if let Err(err) = handler.handle(Arc::clone(&message)).await {
                    first_failure.get_or_insert(err);
                }
            }

            match first_failure {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// A resolved decode target plus its ordered handler list.
pub struct TypeEntry(Box<dyn DispatchEntry>);

impl TypeEntry {
    /// Decode the payload and run all handlers for this type.
    pub async fn dispatch(&self, payload: Bytes) -> Result<()> {
        self.0.dispatch(payload).await
    }

    /// Number of handlers registered for this type.
    pub fn handler_count(&self) -> usize {
        self.0.handler_count()
    }
}

/// Process-wide registry of known payload types.
///
/// Built once at startup, then shared read-only behind an `Arc`. Resolution
/// has no side effects and is invoked once per received envelope.
#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<String, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as a known decode target with no handlers (yet).
    ///
    /// Dispatching a type with zero handlers succeeds; the message is simply
    /// consumed.
    pub fn register_type<T: Message>(&mut self) -> Result<()> {
        // ---
        self.entry_mut::<T>().map(|_| ())
    }

    /// Append a handler for `T`, registering the type if needed.
    pub fn register_handler<T: Message>(
        &mut self,
        handler: impl Handler<T> + 'static,
    ) -> Result<()> {
        // ---
        self.entry_mut::<T>()?.handlers.push(Arc::new(handler));
        Ok(())
    }

    /// Append an async closure as a handler for `T`.
    pub fn register_fn<T, F, Fut>(&mut self, func: F) -> Result<()>
    where
        T: Message,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // ---
        self.register_handler(FnHandler {
            func,
            _marker: PhantomData,
        })
    }

    /// Resolve a wire name to its entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownType`] when the name was never registered; the
    /// envelope cannot be processed, and the caller's failure path applies.
    pub fn resolve(&self, type_name: &str) -> Result<&TypeEntry> {
        // ---
        self.entries
            .get(type_name)
            .ok_or_else(|| Error::UnknownType(type_name.to_owned()))
    }

    /// Whether a wire name is known to this registry.
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    fn entry_mut<T: Message>(&mut self) -> Result<&mut TypedEntry<T>> {
        // ---
        let entry = self
            .entries
            .entry(T::TYPE_NAME.to_owned())
            .or_insert_with(|| {
                TypeEntry(Box::new(TypedEntry::<T> {
                    handlers: Vec::new(),
                }))
            });

        entry
            .0
            .as_any_mut()
            .downcast_mut::<TypedEntry<T>>()
            .ok_or_else(|| {
                Error::Registry(format!(
                    "wire name '{}' is already bound to a different payload type",
                    T::TYPE_NAME
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct Job {
        step: u32,
    }

    impl Message for Job {
        const TYPE_NAME: &'static str = "tests.Job";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Other {
        step: u32,
    }

    impl Message for Other {
        const TYPE_NAME: &'static str = "tests.Job";
    }

    fn payload(step: u32) -> Bytes {
        codec::encode(&Job { step }).unwrap()
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        // ---
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TypeRegistry::new();

        for index in 0..3 {
            let order = Arc::clone(&order);
            registry
                .register_fn::<Job, _, _>(move |_job| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(index);
                        Ok(())
                    }
                })
                .unwrap();
        }

        let entry = registry.resolve(Job::TYPE_NAME).unwrap();
        assert_eq!(entry.handler_count(), 3);

        entry.dispatch(payload(1)).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn first_failure_wins_but_all_handlers_run() {
        // ---
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TypeRegistry::new();

        for index in 0..3u32 {
            let calls = Arc::clone(&calls);
            registry
                .register_fn::<Job, _, _>(move |_job| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.lock().unwrap().push(index);
                        if index < 2 {
                            Err(Error::Handler(format!("handler {index} failed")))
                        } else {
                            Ok(())
                        }
                    }
                })
                .unwrap();
        }

        let outcome = registry
            .resolve(Job::TYPE_NAME)
            .unwrap()
            .dispatch(payload(1))
            .await;

        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
        match outcome {
            Err(Error::Handler(msg)) => assert_eq!(msg, "handler 0 failed"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_handlers_is_a_successful_dispatch() {
        // ---
        let mut registry = TypeRegistry::new();
        registry.register_type::<Job>().unwrap();

        let entry = registry.resolve(Job::TYPE_NAME).unwrap();
        assert_eq!(entry.handler_count(), 0);
        entry.dispatch(payload(1)).await.unwrap();
    }

    #[test]
    fn unknown_type_is_terminal() {
        // ---
        let registry = TypeRegistry::new();
        assert!(matches!(
            registry.resolve("tests.Missing"),
            Err(Error::UnknownType(name)) if name == "tests.Missing"
        ));
    }

    #[test]
    fn conflicting_payload_types_are_rejected() {
        // ---
        let mut registry = TypeRegistry::new();
        registry.register_type::<Job>().unwrap();

        assert!(matches!(
            registry.register_type::<Other>(),
            Err(Error::Registry(_))
        ));
    }

    #[tokio::test]
    async fn payload_decode_failure_surfaces_as_dispatch_failure() {
        // ---
        let mut registry = TypeRegistry::new();
        registry
            .register_fn::<Job, _, _>(|_job| async { Ok(()) })
            .unwrap();

        let outcome = registry
            .resolve(Job::TYPE_NAME)
            .unwrap()
            .dispatch(Bytes::from_static(b"{\"step\": \"nope\"}"))
            .await;

        assert!(matches!(outcome, Err(Error::Decode(_))));
    }
}
