//! CBOR payloads.

use crate::Codec;
use crate::error::{CodecError, Result};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// CBOR codec backed by `ciborium`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn name(&self) -> &'static str {
        "application/cbor"
    }

    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        ciborium::de::from_reader(data)
            .map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        name: String,
        data: Vec<u8>,
    }

    #[test]
    fn test_encode_decode() {
        let record = Record {
            id: 42,
            name: "test".to_string(),
            data: vec![1, 2, 3, 4, 5],
        };
        let encoded = CborCodec.marshal(&record).unwrap();
        assert_eq!(CborCodec.unmarshal::<Record>(&encoded).unwrap(), record);
    }

    #[test]
    fn test_decode_error() {
        let result: Result<Record> = CborCodec.unmarshal(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(CodecError::DeserializationFailed(_))));
    }
}
