//! The unit of exchange between two sockets.

use bytes::Bytes;
use std::collections::HashMap;

/// An opaque message: a header map plus a binary payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Header entries. Keys are unique.
    pub headers: HashMap<String, String>,
    /// Payload bytes.
    pub data: Bytes,
}

impl Message {
    /// Create a message with no headers.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            headers: HashMap::new(),
            data: data.into(),
        }
    }

    /// Add a header, replacing any previous value for the key.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Look up a header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for Message {
    fn from(data: &'static str) -> Self {
        Self::new(Bytes::from_static(data.as_bytes()))
    }
}
