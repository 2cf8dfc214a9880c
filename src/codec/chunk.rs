//! Chunk data and checksum encoding for bulk transfers.
//!
//! Chunk `data` travels as standard base64 with padding. There is no
//! trailing sentinel byte: the decoded bytes are exactly the chunk.
//!
//! `fileCrc32` travels as an 8-digit hex string. Parsing is case-insensitive
//! and tolerates missing leading zeros, since the device formats the value
//! without padding.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{LinkError, Result};

/// Base64 codec for chunk payloads.
pub struct ChunkCodec;

impl ChunkCodec {
    /// Encode raw chunk bytes to base64 text.
    #[inline]
    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    /// Decode base64 chunk text to raw bytes.
    pub fn decode(text: &str) -> Result<Vec<u8>> {
        STANDARD
            .decode(text.as_bytes())
            .map_err(|e| LinkError::MalformedResponse(format!("chunk data is not base64: {e}")))
    }
}

/// CRC-32 (IEEE) checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crc32(pub u32);

impl Crc32 {
    /// Checksum a complete buffer.
    #[inline]
    pub fn of(data: &[u8]) -> Self {
        Crc32(crc32fast::hash(data))
    }

    /// Render as the wire's 8-digit lowercase hex string.
    pub fn to_hex(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl fmt::Display for Crc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for Crc32 {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() || digits.len() > 8 {
            return Err(LinkError::MalformedResponse(format!(
                "fileCrc32 {s:?} is not a 32-bit hex value"
            )));
        }
        u32::from_str_radix(digits, 16)
            .map(Crc32)
            .map_err(|_| LinkError::MalformedResponse(format!("fileCrc32 {s:?} is not hex")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_exact_no_trailer() {
        let encoded = ChunkCodec::encode(b"hello");
        assert_eq!(encoded, "aGVsbG8=");
        assert_eq!(ChunkCodec::decode(&encoded).unwrap(), b"hello");
    }

    #[test]
    fn test_decode_rejects_trailing_nul() {
        let result = ChunkCodec::decode("aGVsbG8=\0");
        assert!(matches!(result, Err(LinkError::MalformedResponse(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ChunkCodec::decode("***").is_err());
    }

    #[test]
    fn test_crc32_known_vector() {
        assert_eq!(Crc32::of(b"123456789"), Crc32(0xCBF4_3926));
        assert_eq!(Crc32::of(b""), Crc32(0));
    }

    #[test]
    fn test_crc32_hex_roundtrip() {
        let crc = Crc32(0x0000_beef);
        assert_eq!(crc.to_hex(), "0000beef");
        assert_eq!("0000beef".parse::<Crc32>().unwrap(), crc);
        assert_eq!("BEEF".parse::<Crc32>().unwrap(), crc);
        assert_eq!("0xbeef".parse::<Crc32>().unwrap(), crc);
    }

    #[test]
    fn test_crc32_parse_rejects_bad_input() {
        assert!("".parse::<Crc32>().is_err());
        assert!("xyz".parse::<Crc32>().is_err());
        assert!("123456789".parse::<Crc32>().is_err());
    }
}
