//! Per-connection receive buffer.
//!
//! Growable byte buffer that is filled from a socket a bounded number of bytes
//! at a time and drained from the front once a complete frame is available.
//! All access is bounds checked; a request to consume more than is buffered
//! is refused rather than clamped.
//!
//! The backing storage is zeroed once when it grows and reused afterwards, so
//! a peer trickling a large payload costs work proportional to what it sends.

use crate::protocol::{decode_frame, DecodeResult, FrameHeader, HEADER_LEN};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

/// Largest slice offered to a single read call.
pub const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub struct RecvBuffer {
    /// Initialized storage; only the first `filled` bytes hold data.
    buf: BytesMut,
    filled: usize,
    /// Parsed header of the frame currently being received.
    header: Option<FrameHeader>,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            filled: 0,
            header: None,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.filled
    }

    /// Append at most `up_to` bytes (and never more than `READ_CHUNK`) read
    /// from `src` with a single read call.
    ///
    /// Returns the number of bytes appended; `Ok(0)` means end of stream.
    /// On error the buffer is left as it was.
    pub fn fill_from<R: Read>(&mut self, src: &mut R, up_to: usize) -> io::Result<usize> {
        let start = self.filled;
        let end = start + up_to.min(READ_CHUNK);
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        let n = src.read(&mut self.buf[start..end])?;
        self.filled += n;
        Ok(n)
    }

    /// The first `n` buffered bytes, if that many are available.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.data().get(..n)
    }

    /// Remove and return the first `n` bytes, or `None` if fewer are buffered.
    pub fn consume(&mut self, n: usize) -> Option<Bytes> {
        if n > self.filled {
            return None;
        }
        self.filled -= n;
        Some(self.buf.split_to(n).freeze())
    }

    /// Parse the header once enough bytes are buffered. The result is cached
    /// until the frame is taken.
    pub fn parse_header(&mut self) -> Option<FrameHeader> {
        if self.header.is_none() {
            self.header = self.peek(HEADER_LEN).and_then(FrameHeader::decode);
        }
        self.header
    }

    /// Remove one complete frame from the front of the buffer.
    pub fn take_frame(&mut self, max_frame_size: usize) -> DecodeResult {
        match decode_frame(self.data(), max_frame_size) {
            DecodeResult::Complete(frame, consumed) => {
                self.consume(consumed);
                self.header = None;
                DecodeResult::Complete(frame, consumed)
            }
            other => other,
        }
    }

    fn data(&self) -> &[u8] {
        &self.buf[..self.filled]
    }
}
