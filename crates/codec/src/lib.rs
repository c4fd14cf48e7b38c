//! Payload codecs for message bodies.
//!
//! Transports carry opaque bytes. Callers pick a [`Codec`] to turn typed
//! values into a [`Message`] payload and back; the codec's name travels in
//! the `content-type` header so the peer can check it. [`ProtobufCodec`]
//! does the same for `prost` messages.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cbor;
mod error;
mod json;
mod protobuf;

pub use cbor::CborCodec;
pub use error::{CodecError, Result};
pub use json::JsonCodec;
pub use protobuf::ProtobufCodec;

use bytes::Bytes;
use mice_transport::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Header naming the codec a payload was produced with.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Serializes values to and from payload bytes.
pub trait Codec: Send + Sync {
    /// Content-type style label, e.g. `application/json`.
    fn name(&self) -> &'static str;

    /// Serialize `value`.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailed` if the value cannot be represented.
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes>;

    /// Deserialize a value from `data`.
    ///
    /// # Errors
    ///
    /// Returns `DeserializationFailed` if `data` is not a valid encoding of `T`.
    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;

    /// Build a message whose payload is `value`, tagged with this codec's
    /// content type.
    ///
    /// # Errors
    ///
    /// See [`Codec::marshal`].
    fn to_message<T: Serialize + ?Sized>(&self, value: &T) -> Result<Message> {
        Ok(Message::new(self.marshal(value)?).with_header(CONTENT_TYPE_HEADER, self.name()))
    }

    /// Decode a message payload. A message without a content type is
    /// accepted as-is.
    ///
    /// # Errors
    ///
    /// Returns `ContentTypeMismatch` if the message was tagged by another
    /// codec, otherwise see [`Codec::unmarshal`].
    fn from_message<T: DeserializeOwned>(&self, msg: &Message) -> Result<T> {
        check_content_type(self.name(), msg)?;
        self.unmarshal(&msg.data)
    }
}

/// Reject a message tagged with a content type other than `expected`.
pub(crate) fn check_content_type(expected: &'static str, msg: &Message) -> Result<()> {
    match msg.header(CONTENT_TYPE_HEADER) {
        Some(actual) if actual != expected => Err(CodecError::ContentTypeMismatch {
            expected,
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}
