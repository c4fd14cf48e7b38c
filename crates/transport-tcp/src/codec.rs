//! Length-prefixed binary framing for messages on a raw TCP stream.
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! +----------------+-------+-------------------------------+---------+
//! | frame_length   | count | count x (klen key vlen value) | payload |
//! | i32            | u8    | u16 bytes u16 bytes           | rest    |
//! +----------------+-------+-------------------------------+---------+
//! ```
//!
//! `frame_length` counts everything after itself. The payload is whatever
//! remains of the frame once the headers have been read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mice_transport::{Message, Result, TransportError};
use std::collections::HashMap;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum frame size (10 MiB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Most headers one frame can carry.
pub const MAX_HEADERS: usize = u8::MAX as usize;

/// Most bytes one header key or value can carry.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

const LENGTH_PREFIX: usize = 4;

/// Size of the frame body for `msg`, excluding the 4-byte length prefix.
#[must_use]
pub fn message_size(msg: &Message) -> usize {
    let headers: usize = msg
        .headers
        .iter()
        .map(|(key, value)| 2 + key.len() + 2 + value.len())
        .sum();
    1 + headers + msg.data.len()
}

/// Encode one message into a standalone frame.
///
/// # Errors
///
/// See [`MessageCodec`]'s encoder.
pub fn encode(msg: &Message) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    MessageCodec::new().encode(msg, &mut buf)?;
    Ok(buf)
}

/// Decode exactly one frame from `frame`.
///
/// # Errors
///
/// Returns `ShortRead` if the frame is incomplete and `MalformedFrame` if it
/// is followed by trailing bytes or cannot be parsed.
pub fn decode(frame: &[u8]) -> Result<Message> {
    let mut buf = BytesMut::from(frame);
    let msg = MessageCodec::new()
        .decode_eof(&mut buf)?
        .ok_or(TransportError::ShortRead {
            expected: LENGTH_PREFIX,
            actual: 0,
        })?;
    if !buf.is_empty() {
        return Err(TransportError::MalformedFrame(format!(
            "{} trailing bytes after frame",
            buf.len()
        )));
    }
    Ok(msg)
}

/// Stream codec for [`Message`] frames.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl MessageCodec {
    /// Create a codec with the default frame limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec that rejects frames above `max_frame_size`.
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn check(&self, msg: &Message) -> Result<usize> {
        if msg.headers.len() > MAX_HEADERS {
            return Err(TransportError::TooManyHeaders(msg.headers.len()));
        }
        for (key, value) in &msg.headers {
            for field in [key, value] {
                if field.len() > MAX_FIELD_LEN {
                    return Err(TransportError::HeaderTooLong(field.len()));
                }
            }
        }

        let size = message_size(msg);
        if size > self.max_frame_size || i32::try_from(size).is_err() {
            return Err(TransportError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(size)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = TransportError;

    /// Nothing is written to `dst` when the message is rejected.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<()> {
        let size = self.check(msg)?;

        dst.reserve(LENGTH_PREFIX + size);
        dst.put_i32_le(size as i32);
        dst.put_u8(msg.headers.len() as u8);
        for (key, value) in &msg.headers {
            put_field(dst, key);
            put_field(dst, value);
        }
        dst.put_slice(&msg.data);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let frame_len = frame_length(src)?;
        if frame_len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }
        if frame_len == 0 {
            return Err(TransportError::MalformedFrame(
                "frame is missing its header count".into(),
            ));
        }

        let total = LENGTH_PREFIX + frame_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let frame = src.split_to(frame_len).freeze();
        decode_body(frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            None if buf.len() < LENGTH_PREFIX => Err(TransportError::ShortRead {
                expected: LENGTH_PREFIX,
                actual: buf.len(),
            }),
            None => Err(TransportError::ShortRead {
                expected: frame_length(buf)?,
                actual: buf.len() - LENGTH_PREFIX,
            }),
        }
    }
}

fn frame_length(src: &[u8]) -> Result<usize> {
    let mut prefix = &src[..LENGTH_PREFIX];
    let len = prefix.get_i32_le();
    usize::try_from(len)
        .map_err(|_| TransportError::MalformedFrame(format!("negative frame length {len}")))
}

fn decode_body(mut frame: Bytes) -> Result<Message> {
    let count = usize::from(frame.get_u8());
    let mut headers = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_field(&mut frame)?;
        let value = read_field(&mut frame)?;
        headers.insert(key, value);
    }
    Ok(Message {
        headers,
        data: frame,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn put_field(dst: &mut BytesMut, field: &str) {
    dst.put_u16_le(field.len() as u16);
    dst.put_slice(field.as_bytes());
}

fn read_field(frame: &mut Bytes) -> Result<String> {
    if frame.remaining() < 2 {
        return Err(TransportError::MalformedFrame(
            "header length runs past end of frame".into(),
        ));
    }
    let len = usize::from(frame.get_u16_le());
    if frame.remaining() < len {
        return Err(TransportError::MalformedFrame(format!(
            "header of {len} bytes runs past end of frame"
        )));
    }
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| TransportError::MalformedFrame(format!("header is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_layout() {
        let msg = Message::new(vec![9u8]).with_header("a", "1");
        let frame = encode(&msg).unwrap();
        assert_eq!(&frame[..], &[8, 0, 0, 0, 1, 1, 0, b'a', 1, 0, b'1', 9]);
    }

    #[test]
    fn test_message_size() {
        let msg = Message::new(vec![0u8; 4])
            .with_header("a", "1")
            .with_header("b", "2");
        assert_eq!(message_size(&msg), 17);
        assert_eq!(encode(&msg).unwrap().len(), 21);
    }

    #[test]
    fn test_empty_message() {
        let frame = encode(&Message::default()).unwrap();
        assert_eq!(&frame[..], &[1, 0, 0, 0, 0]);
        assert_eq!(decode(&frame).unwrap(), Message::default());
    }

    #[test]
    fn test_header_limits() {
        let mut msg = Message::default();
        for i in 0..MAX_HEADERS {
            msg.headers.insert(format!("k{i}"), String::new());
        }
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);

        msg.headers.insert("one-too-many".into(), String::new());
        let mut dst = BytesMut::new();
        let err = MessageCodec::new().encode(&msg, &mut dst).unwrap_err();
        assert!(matches!(err, TransportError::TooManyHeaders(256)));
        assert!(dst.is_empty());

        let long = Message::default().with_header("k", "v".repeat(MAX_FIELD_LEN + 1));
        assert!(matches!(
            encode(&long),
            Err(TransportError::HeaderTooLong(65536))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = MessageCodec::with_max_frame_size(8);
        let mut dst = BytesMut::new();
        let err = codec
            .encode(&Message::new(vec![0u8; 16]), &mut dst)
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 17, max: 8 }));

        let mut src = BytesMut::from(&[64u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(TransportError::FrameTooLarge { size: 64, .. })
        ));
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = encode(&Message::from("hello")).unwrap();
        let mut codec = MessageCodec::new();

        let mut src = BytesMut::from(&frame[..3]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&frame[3..7]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&frame[7..]);
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg.data, Bytes::from_static(b"hello"));
        assert!(src.is_empty());
    }

    #[test]
    fn test_short_read_at_eof() {
        let frame = encode(&Message::from("hello")).unwrap();
        let mut codec = MessageCodec::new();

        let mut src = BytesMut::from(&frame[..6]);
        assert!(matches!(
            codec.decode_eof(&mut src),
            Err(TransportError::ShortRead {
                expected: 6,
                actual: 2
            })
        ));

        let mut src = BytesMut::from(&frame[..2]);
        assert!(matches!(
            codec.decode_eof(&mut src),
            Err(TransportError::ShortRead {
                expected: 4,
                actual: 2
            })
        ));

        assert!(codec.decode_eof(&mut BytesMut::new()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames() {
        // Negative length.
        assert!(matches!(
            decode(&[0xff, 0xff, 0xff, 0xff, 0]),
            Err(TransportError::MalformedFrame(_))
        ));
        // Header key length runs past the frame.
        assert!(matches!(
            decode(&[4, 0, 0, 0, 1, 9, 0, b'a']),
            Err(TransportError::MalformedFrame(_))
        ));
        // Non-UTF-8 key.
        assert!(matches!(
            decode(&[7, 0, 0, 0, 1, 1, 0, 0xff, 1, 0, b'1']),
            Err(TransportError::MalformedFrame(_))
        ));
        // Zero-length frame has no header count.
        assert!(matches!(
            decode(&[0, 0, 0, 0]),
            Err(TransportError::MalformedFrame(_))
        ));
        // Trailing bytes.
        assert!(matches!(
            decode(&[1, 0, 0, 0, 0, 7]),
            Err(TransportError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut src = encode(&Message::from("one")).unwrap();
        src.extend_from_slice(&encode(&Message::from("two")).unwrap());

        let mut codec = MessageCodec::new();
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().data, "one");
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().data, "two");
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            headers in prop::collection::hash_map("[a-zA-Z0-9-]{0,16}", "\\PC{0,32}", 0..24),
            data in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let msg = Message { headers, data: Bytes::from(data) };
            let frame = encode(&msg).unwrap();
            prop_assert_eq!(frame.len(), LENGTH_PREFIX + message_size(&msg));
            prop_assert_eq!(decode(&frame).unwrap(), msg);
        }
    }
}
