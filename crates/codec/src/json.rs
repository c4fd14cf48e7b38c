//! JSON payloads.

use crate::Codec;
use crate::error::{CodecError, Result};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "application/json"
    }

    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        to: String,
        times: u8,
    }

    #[test]
    fn test_encode_decode() {
        let greeting = Greeting {
            to: "world".into(),
            times: 2,
        };
        let encoded = JsonCodec.marshal(&greeting).unwrap();
        assert_eq!(&encoded[..], br#"{"to":"world","times":2}"#);
        assert_eq!(JsonCodec.unmarshal::<Greeting>(&encoded).unwrap(), greeting);
    }

    #[test]
    fn test_decode_error() {
        let result: Result<Greeting> = JsonCodec.unmarshal(b"{\"to\":");
        assert!(matches!(result, Err(CodecError::DeserializationFailed(_))));
    }
}
