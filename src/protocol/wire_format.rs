//! Frame header encoding and decoding.
//!
//! ```text
//! ┌────────┬──────────────────────────────┐
//! │ Marker │ Payload length               │
//! │ 1 byte │ 9 bytes, ASCII decimal,      │
//! │  '#'   │ zero padded                  │
//! └────────┴──────────────────────────────┘
//! ```
//!
//! The payload (UTF-8 JSON) follows immediately.

use crate::error::{LinkError, Result};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Frame marker byte.
pub const MARKER: u8 = b'#';

/// Width of the decimal length field.
pub const LENGTH_DIGITS: usize = 9;

/// Largest payload the 9-digit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = 999_999_999;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_length: usize,
}

impl Header {
    /// Create a header for a payload of the given length.
    ///
    /// Fails if the length does not fit the 9-digit field.
    pub fn new(payload_length: usize) -> Result<Self> {
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge {
                size: payload_length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self { payload_length })
    }

    /// Encode header to bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use desklink::protocol::Header;
    ///
    /// let header = Header::new(42).unwrap();
    /// assert_eq!(&header.encode(), b"#000000042");
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Write the header into the first `HEADER_SIZE` bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (10 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = MARKER;
        let mut value = self.payload_length;
        for slot in buf[1..HEADER_SIZE].iter_mut().rev() {
            *slot = b'0' + (value % 10) as u8;
            value /= 10;
        }
    }

    /// Decode header from bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use desklink::protocol::Header;
    ///
    /// let header = Header::decode(b"#000000009{\"a\":1}").unwrap();
    /// assert_eq!(header.payload_length, 9);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(LinkError::MalformedHeader(format!(
                "need {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }

        if buf[0] != MARKER {
            return Err(LinkError::MalformedHeader(format!(
                "expected marker 0x{:02x}, got 0x{:02x}",
                MARKER, buf[0]
            )));
        }

        let mut payload_length = 0usize;
        for &digit in &buf[1..HEADER_SIZE] {
            if !digit.is_ascii_digit() {
                return Err(LinkError::MalformedHeader(format!(
                    "non-decimal length byte 0x{:02x}",
                    digit
                )));
            }
            payload_length = payload_length * 10 + usize::from(digit - b'0');
        }

        Ok(Self { payload_length })
    }

    /// Validate the declared length against a configured limit.
    pub fn validate(&self, max_payload_size: usize) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(LinkError::PayloadTooLarge {
                size: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(())
    }
}

/// Encode a header for `payload_length` bytes (standalone function).
#[inline]
pub fn encode_header(payload_length: usize) -> Result<[u8; HEADER_SIZE]> {
    Ok(Header::new(payload_length)?.encode())
}

/// Decode the declared payload length from a header (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<usize> {
    Header::decode(buf).map(|h| h.payload_length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(123_456).unwrap();
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_zero_padding() {
        assert_eq!(&encode_header(0).unwrap(), b"#000000000");
        assert_eq!(&encode_header(9).unwrap(), b"#000000009");
        assert_eq!(&encode_header(42).unwrap(), b"#000000042");
        assert_eq!(&encode_header(MAX_PAYLOAD_SIZE).unwrap(), b"#999999999");
    }

    #[test]
    fn test_header_size_is_exactly_10() {
        assert_eq!(HEADER_SIZE, 1 + LENGTH_DIGITS);
        assert_eq!(Header::new(1).unwrap().encode().len(), 10);
    }

    #[test]
    fn test_payload_too_large_rejected() {
        let result = Header::new(MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(result, Err(LinkError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let result = decode_header(b"#00000");
        assert!(matches!(result, Err(LinkError::MalformedHeader(_))));
    }

    #[test]
    fn test_decode_wrong_marker() {
        let result = decode_header(b"$000000009");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("expected marker 0x23"));
    }

    #[test]
    fn test_decode_non_digit_length() {
        assert!(decode_header(b"#00000x009").is_err());
        assert!(decode_header(b"#0000 0009").is_err());
        assert!(decode_header(b"#-00000009").is_err());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode_header(b"#000000002{}").unwrap(), 2);
    }

    #[test]
    fn test_validate_against_limit() {
        let header = Header::new(1_000).unwrap();
        assert!(header.validate(1_000).is_ok());
        let err = header.validate(999).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_encode_into() {
        let header = Header::new(77).unwrap();
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf);
        assert_eq!(&buf, b"#000000077");
    }
}
