//! Wire format for the framed request/response protocol.
//!
//! Every frame is a fixed 12-byte header followed by `data_len` payload bytes:
//!
//! ```text
//! +-----------+-----------+-------------+------------------+
//! | msg_id:u32| type:u32  | data_len:u32| payload[data_len]|
//! +-----------+-----------+-------------+------------------+
//! ```
//!
//! Integers are in host byte order; client and server are assumed to run on
//! the same architecture. Responses echo the request's `msg_id` and type.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Message type carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    Msg = 1,
    Req = 2,
    Unknown = 3,
}

impl MsgType {
    /// Decode a raw header value. Anything other than `Msg`/`Req` is `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => MsgType::Msg,
            2 => MsgType::Req,
            _ => MsgType::Unknown,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_id: u32,
    pub msg_type: MsgType,
    pub data_len: u32,
}

impl FrameHeader {
    /// Decode a header from the first `HEADER_LEN` bytes of `buf`.
    ///
    /// Returns `None` if fewer than `HEADER_LEN` bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let raw = buf.get(..HEADER_LEN)?;
        let word = |i: usize| u32::from_ne_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Some(FrameHeader {
            msg_id: word(0),
            msg_type: MsgType::from_raw(word(4)),
            data_len: word(8),
        })
    }

    /// Append the encoded header to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(&self.msg_id.to_ne_bytes());
        out.put_slice(&self.msg_type.as_raw().to_ne_bytes());
        out.put_slice(&self.data_len.to_ne_bytes());
    }

    /// Declared payload length, checked against the configured maximum.
    pub fn payload_len(&self, max_frame_size: usize) -> Result<usize, ProtocolError> {
        let len = self.data_len as usize;
        if len > max_frame_size {
            return Err(ProtocolError::PayloadTooLarge {
                len,
                max: max_frame_size,
            });
        }
        Ok(len)
    }
}

/// A decoded frame: header plus owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Protocol violations. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared payload exceeds the configured maximum frame size.
    PayloadTooLarge { len: usize, max: usize },
    /// Payload does not fit the 32-bit length field.
    Truncated(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PayloadTooLarge { len, max } => {
                write!(f, "payload length {} exceeds maximum frame size {}", len, max)
            }
            ProtocolError::Truncated(len) => {
                write!(f, "payload length {} does not fit in a frame header", len)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Result of decoding a frame from a byte buffer.
#[derive(Debug)]
pub enum DecodeResult {
    /// A complete frame and the number of bytes it occupied.
    Complete(Frame, usize),
    /// Need more data.
    Incomplete,
    /// The header violates the protocol.
    Error(ProtocolError),
}

/// Build a complete frame for `payload`.
pub fn encode_frame(msg_id: u32, msg_type: MsgType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let data_len =
        u32::try_from(payload.len()).map_err(|_| ProtocolError::Truncated(payload.len()))?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    FrameHeader {
        msg_id,
        msg_type,
        data_len,
    }
    .encode_into(&mut out);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Decode one frame from the front of `input`.
///
/// The length check happens as soon as the header is available, so an
/// oversized frame is rejected without waiting for its payload.
pub fn decode_frame(input: &[u8], max_frame_size: usize) -> DecodeResult {
    let header = match FrameHeader::decode(input) {
        Some(header) => header,
        None => return DecodeResult::Incomplete,
    };
    let len = match header.payload_len(max_frame_size) {
        Ok(len) => len,
        Err(e) => return DecodeResult::Error(e),
    };
    let total = HEADER_LEN + len;
    if input.len() < total {
        return DecodeResult::Incomplete;
    }

    let payload = Bytes::copy_from_slice(&input[HEADER_LEN..total]);
    DecodeResult::Complete(Frame { header, payload }, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64 * 1024;

    #[test]
    fn test_round_trip_sizes() {
        for size in [0usize, 1, 11, 12, 13, 4096, MAX] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let encoded = encode_frame(42, MsgType::Req, &payload).unwrap();
            assert_eq!(encoded.len(), HEADER_LEN + size);

            match decode_frame(&encoded, MAX) {
                DecodeResult::Complete(frame, consumed) => {
                    assert_eq!(consumed, encoded.len());
                    assert_eq!(frame.header.msg_id, 42);
                    assert_eq!(frame.header.msg_type, MsgType::Req);
                    assert_eq!(frame.header.data_len as usize, size);
                    assert_eq!(&frame.payload[..], &payload[..]);
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_header_layout_is_host_order() {
        let encoded = encode_frame(7, MsgType::Msg, b"x").unwrap();
        assert_eq!(&encoded[0..4], &7u32.to_ne_bytes());
        assert_eq!(&encoded[4..8], &1u32.to_ne_bytes());
        assert_eq!(&encoded[8..12], &1u32.to_ne_bytes());
        assert_eq!(&encoded[12..], b"x");
    }

    #[test]
    fn test_incomplete_header_and_payload() {
        let encoded = encode_frame(1, MsgType::Msg, b"hello").unwrap();
        assert!(matches!(decode_frame(&encoded[..5], MAX), DecodeResult::Incomplete));
        assert!(matches!(
            decode_frame(&encoded[..HEADER_LEN + 2], MAX),
            DecodeResult::Incomplete
        ));
    }

    #[test]
    fn test_oversized_header_rejected_before_payload() {
        let mut buf = BytesMut::new();
        FrameHeader {
            msg_id: 3,
            msg_type: MsgType::Req,
            data_len: (MAX + 1) as u32,
        }
        .encode_into(&mut buf);

        match decode_frame(&buf, MAX) {
            DecodeResult::Error(ProtocolError::PayloadTooLarge { len, max }) => {
                assert_eq!(len, MAX + 1);
                assert_eq!(max, MAX);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_values() {
        assert_eq!(MsgType::from_raw(1), MsgType::Msg);
        assert_eq!(MsgType::from_raw(2), MsgType::Req);
        assert_eq!(MsgType::from_raw(3), MsgType::Unknown);
        assert_eq!(MsgType::from_raw(0), MsgType::Unknown);
        assert_eq!(MsgType::from_raw(99), MsgType::Unknown);
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let mut buf = encode_frame(5, MsgType::Msg, b"ab").unwrap().to_vec();
        buf.extend_from_slice(b"next");
        match decode_frame(&buf, MAX) {
            DecodeResult::Complete(frame, consumed) => {
                assert_eq!(consumed, HEADER_LEN + 2);
                assert_eq!(&frame.payload[..], b"ab");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
