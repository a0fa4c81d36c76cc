//! Pluggable payload serialization.
//!
//! The engine only ever asks a serializer for `bytes -> T` and `T -> bytes`;
//! the binary [`Bincode`] codec and the structured-text [`Json`] codec are
//! interchangeable as long as both ends of a channel agree. Implementations
//! must be deterministic and side-effect free.

mod binary;
mod json;

pub use binary::Bincode;
pub use json::Json;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("failed to encode or decode JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes typed payloads to bytes and back.
pub trait Serializer: Default + Send + Sync + 'static {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}
