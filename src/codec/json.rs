//! JSON codec using `serde_json`.
//!
//! Messages are encoded compactly (no whitespace) since the frame header
//! carries the exact byte length and the device parser counts bytes.

use crate::error::{LinkError, Result};

/// JSON codec for structured message payloads.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to compact JSON bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes into a value.
    ///
    /// Decoding failures are reported as `MalformedResponse`: anything this
    /// codec decodes arrived from the peer.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| LinkError::MalformedResponse(e.to_string()))
    }
}
