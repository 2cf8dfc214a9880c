//! Codec module - payload serialization.
//!
//! - [`JsonCodec`] - JSON bodies of logical messages (`serde_json`)
//! - [`ChunkCodec`] - base64 chunk data and CRC-32 checksums for bulk transfers
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so the codec is fixed at compile time.
//!
//! # Example
//!
//! ```
//! use desklink::codec::{ChunkCodec, JsonCodec};
//!
//! let encoded = JsonCodec::encode(&"hello").unwrap();
//! let decoded: String = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let data = ChunkCodec::encode(b"binary data");
//! assert_eq!(ChunkCodec::decode(&data).unwrap(), b"binary data");
//! ```

mod chunk;
mod json;

pub use chunk::{ChunkCodec, Crc32};
pub use json::JsonCodec;
