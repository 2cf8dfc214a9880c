//! Protocol module - wire format, framing, and logical messages.
//!
//! This module implements the device link protocol:
//! - 10-byte header encoding/decoding (`#` + 9 decimal digits)
//! - Frame buffer for accumulating partial reads
//! - Request/response messages carried in frame payloads

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, build_frame_parts, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{Endpoint, Method, Request, Response, Status};
pub use wire_format::{
    decode_header, encode_header, Header, HEADER_SIZE, LENGTH_DIGITS, MARKER, MAX_PAYLOAD_SIZE,
};
