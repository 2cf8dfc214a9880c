//! Reassembly of frames from arbitrary stream fragments.
//!
//! Serial reads return whatever the USB stack had ready: half a header, a
//! header and part of its JSON, or several small responses at once.
//! `FrameBuffer` keeps the leftovers in a `BytesMut` and tracks one of two
//! phases:
//!
//! - `Header`: fewer than 10 bytes of the next frame are known
//! - `Payload`: the header was decoded and its payload is still incomplete
//!
//! The transaction engine does exact reads instead; this buffer is for
//! consumers that read in bulk, such as the device emulator's serve loop.
//!
//! # Example
//!
//! ```
//! use desklink::protocol::{build_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(b"{}").unwrap();
//!
//! assert!(buffer.push(&bytes[..4]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[4..]).unwrap();
//! assert_eq!(frames[0].payload(), b"{}");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{Header, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use super::Frame;
use crate::error::Result;

const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Header,
    Payload { header: Header },
}

/// Accumulates stream bytes and yields complete frames.
pub struct FrameBuffer {
    pending: BytesMut,
    phase: Phase,
    max_payload_size: usize,
}

impl FrameBuffer {
    /// Buffer accepting any payload the 9-digit length field can express.
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Buffer rejecting declared payloads over `max_payload_size`.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(INITIAL_CAPACITY),
            phase: Phase::Header,
            max_payload_size,
        }
    }

    /// Append `data` and drain every frame it completes.
    ///
    /// Bytes of an unfinished frame stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// `MalformedHeader` or `PayloadTooLarge`. There is no way to find the
    /// next frame boundary after either, so the buffer is reset.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.pending.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(frames),
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Phase::Header = self.phase {
            if self.pending.len() < HEADER_SIZE {
                return Ok(None);
            }
            let header = Header::decode(&self.pending[..HEADER_SIZE])?;
            header.validate(self.max_payload_size)?;
            self.pending.advance(HEADER_SIZE);
            self.phase = Phase::Payload { header };
        }

        let Phase::Payload { header } = self.phase else {
            return Ok(None);
        };
        if self.pending.len() < header.payload_length {
            return Ok(None);
        }

        let payload = if header.payload_length == 0 {
            Bytes::new()
        } else {
            self.pending.split_to(header.payload_length).freeze()
        };
        self.phase = Phase::Header;
        Ok(Some(Frame { header, payload }))
    }

    /// Number of buffered bytes not yet part of a returned frame.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop buffered bytes and wait for a fresh header.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.phase = Phase::Header;
    }

    #[cfg(test)]
    fn mid_payload(&self) -> bool {
        matches!(self.phase, Phase::Payload { .. })
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
