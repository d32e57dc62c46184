//! Envelope codec.
//!
//! Pure serialize/deserialize between values and transport-neutral byte
//! buffers. JSON is the wire format; both directions are deterministic for a
//! given input, perform no I/O, and are safe to call concurrently.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// Encode a value into a payload buffer.
///
/// # Errors
///
/// Returns [`Error::Encode`] if the value cannot be represented in the wire
/// format (e.g. a map with non-string keys).
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    // ---
    let encoded = serde_json::to_vec(value).map_err(Error::Encode)?;
    Ok(Bytes::from(encoded))
}

/// Decode a payload buffer into a value of the expected type.
///
/// # Errors
///
/// Returns [`Error::Decode`] on malformed input or a schema mismatch.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    // ---
    serde_json::from_slice(bytes).map_err(Error::Decode)
}
