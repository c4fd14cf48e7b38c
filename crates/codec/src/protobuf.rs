//! Protocol Buffers payloads.
//!
//! Protobuf types are generated by `prost` rather than derived through serde,
//! so this codec takes `prost::Message` values and sits beside the serde
//! [`Codec`](crate::Codec) trait instead of implementing it.

use crate::error::{CodecError, Result};
use crate::{CONTENT_TYPE_HEADER, check_content_type};
use bytes::Bytes;
use mice_transport::Message;

/// Protobuf codec backed by `prost`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl ProtobufCodec {
    /// Content type label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        "application/protobuf"
    }

    /// Encode `value`.
    ///
    /// Encoding into a growable buffer cannot run out of space, so this never
    /// fails for a well-formed message.
    #[must_use]
    pub fn marshal<M: prost::Message>(&self, value: &M) -> Bytes {
        Bytes::from(value.encode_to_vec())
    }

    /// Decode a `M` from `data`.
    ///
    /// # Errors
    ///
    /// Returns `DeserializationFailed` if `data` is not a valid encoding.
    pub fn unmarshal<M: prost::Message + Default>(&self, data: &[u8]) -> Result<M> {
        M::decode(data).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }

    /// Build a message whose payload is `value`.
    #[must_use]
    pub fn to_message<M: prost::Message>(&self, value: &M) -> Message {
        Message::new(self.marshal(value)).with_header(CONTENT_TYPE_HEADER, self.name())
    }

    /// Decode a message payload, checking its content type if present.
    ///
    /// # Errors
    ///
    /// Returns `ContentTypeMismatch` or `DeserializationFailed`.
    pub fn from_message<M: prost::Message + Default>(&self, msg: &Message) -> Result<M> {
        check_content_type(self.name(), msg)?;
        self.unmarshal(&msg.data)
    }
}
