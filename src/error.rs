use thiserror::Error;

/// Errors that can occur while publishing, consuming, or dispatching work.
#[derive(Error, Debug)]
pub enum Error {
    /// A value could not be serialized into an envelope payload.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// A byte buffer could not be deserialized into the expected type.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The envelope's type name is not present in the type registry.
    ///
    /// Terminal for that envelope; it cannot be dispatched to any handler.
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// A publish failed after exhausting its retry budget.
    ///
    /// Callers must treat this as a failed submission, not retry it further.
    #[error("publish to exchange '{exchange}' failed after {attempts} attempts: {cause}")]
    Publish {
        exchange: String,
        attempts: u32,
        cause: String,
    },

    /// A broker connection or channel operation failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// A message handler reported a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// Handler registration was rejected (e.g. one wire name bound to two
    /// different payload types).
    #[error("registry error: {0}")]
    Registry(String),

    /// The result store rejected an operation.
    #[error("result store error: {0}")]
    Store(String),
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, Error>;
