//! Frame struct and frame builders.
//!
//! A frame is one marker + length + payload unit on the wire.
//! Payloads are `bytes::Bytes`, so frames split out of a read buffer share it.
//!
//! # Example
//!
//! ```
//! use desklink::protocol::build_frame;
//!
//! let bytes = build_frame(br#"{"a":1}"#).unwrap();
//! assert_eq!(&bytes[..10], b"#000000007");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};
use crate::error::Result;

/// One marker + length + payload unit.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// JSON payload as received.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame around a payload.
    pub fn new(payload: Bytes) -> Result<Self> {
        Ok(Self {
            header: Header::new(payload.len())?,
            payload,
        })
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length, equal to `header.payload_length`.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Interpret the payload as UTF-8 text.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Encode this frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Frame `payload` into one contiguous buffer.
///
/// Returns `marker + zero_padded(len, 9) + payload`. Payloads over
/// 999,999,999 bytes are rejected; callers chunk larger data.
pub fn build_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let header = Header::new(payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Build frame parts for vectored writes.
pub fn build_frame_parts(payload: &[u8]) -> Result<([u8; HEADER_SIZE], &[u8])> {
    Ok((Header::new(payload.len())?.encode(), payload))
}
