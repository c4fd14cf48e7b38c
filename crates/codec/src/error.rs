//! Error types for payload codecs.

use thiserror::Error;

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to serialize a value.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize a payload.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// A message carries a different content type than the codec expects.
    #[error("Content type mismatch: expected {expected}, got {actual}")]
    ContentTypeMismatch {
        /// The codec's content type.
        expected: &'static str,
        /// The content type found on the message.
        actual: String,
    },
}
