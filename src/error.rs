//! Error types for desklink.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::Status;

/// Main error type for all desklink operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No device at the given path, or discovery found no match.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device exists but could not be opened (permissions, in use).
    #[error("Device {path} unavailable: {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A discovery candidate exposes unreadable or unparseable identifiers.
    #[error("Device {path} is malformed: {reason}")]
    MalformedDevice { path: String, reason: String },

    /// The byte stream ended or was closed mid-operation.
    #[error("Device disconnected")]
    Disconnected,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded wait elapsed.
    #[error("Timed out after {after:?} waiting for {stage}")]
    Timeout { stage: TimeoutStage, after: Duration },

    /// Frame header with a bad marker or non-decimal length.
    #[error("Malformed frame header: {0}")]
    MalformedHeader(String),

    /// Payload does not fit the 9-digit length field (or a configured limit).
    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Response payload could not be parsed into the expected shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// JSON serialization error while building a request.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The response answers a different request.
    #[error("Response uuid {received} does not match request uuid {expected}")]
    CorrelationMismatch { expected: u32, received: u32 },

    /// A previous exchange on this transport never completed.
    #[error("A transaction is already in flight on this transport")]
    TransactionInFlight,

    /// An earlier failure left the stream between frames; nothing read from
    /// it can be trusted until the device is reopened.
    #[error("Stream position lost after an earlier failure; reopen the device")]
    Desynchronized,

    /// The peer answered with a non-success status.
    #[error("{context} rejected with status {status}{}", fmt_reason(.reason))]
    Status {
        status: Status,
        context: String,
        reason: Option<String>,
    },

    /// A single chunk transaction failed, aborting the transfer.
    #[error("{direction} chunk {chunk_no}/{total_chunks} failed: {source}")]
    Chunk {
        direction: Direction,
        chunk_no: u32,
        total_chunks: u32,
        #[source]
        source: Box<LinkError>,
    },

    /// Reassembled data failed verification.
    #[error("Integrity check failed: {0}")]
    Integrity(IntegrityFailure),
}

fn fmt_reason(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

/// Which wait timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// Waiting for a matching device to appear.
    Discovery,
    /// Raw transport read.
    Read,
    /// Waiting for the 10-byte response header.
    Header,
    /// Waiting for the declared response payload.
    Payload,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutStage::Discovery => "device discovery",
            TimeoutStage::Read => "transport read",
            TimeoutStage::Header => "response header",
            TimeoutStage::Payload => "response payload",
        };
        f.write_str(name)
    }
}

/// Transfer direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Post-transfer verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityFailure {
    #[error("CRC-32 mismatch: expected {expected:08x}, computed {actual:08x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("length mismatch: expected {expected} bytes, assembled {actual}")]
    Length { expected: u64, actual: u64 },
}

impl LinkError {
    /// Status code carried by this error, looking through chunk context.
    pub fn status(&self) -> Option<Status> {
        match self {
            LinkError::Status { status, .. } => Some(*status),
            LinkError::Chunk { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Check if this error (or the chunk failure it wraps) is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            LinkError::Timeout { .. } => true,
            LinkError::Chunk { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Check if the session must be reopened before further use.
    ///
    /// A `Header` timeout is not fatal by itself: the request is remembered
    /// and its late response skipped. If part of a header had already
    /// arrived, the engine reports `Desynchronized` on the next call.
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            LinkError::Disconnected
            | LinkError::Io(_)
            | LinkError::NotFound(_)
            | LinkError::DeviceUnavailable { .. }
            | LinkError::MalformedHeader(_)
            | LinkError::TransactionInFlight
            | LinkError::Desynchronized => true,
            LinkError::Timeout { stage, .. } => *stage == TimeoutStage::Payload,
            LinkError::Chunk { source, .. } => source.is_fatal_to_session(),
            _ => false,
        }
    }

    /// Process exit code for harness front-ends, one per error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            LinkError::NotFound(_) => 10,
            LinkError::DeviceUnavailable { .. } | LinkError::MalformedDevice { .. } => 11,
            LinkError::Disconnected | LinkError::Io(_) => 12,
            LinkError::Timeout { .. } => 13,
            LinkError::MalformedHeader(_)
            | LinkError::PayloadTooLarge { .. }
            | LinkError::MalformedResponse(_)
            | LinkError::Json(_) => 14,
            LinkError::CorrelationMismatch { .. }
            | LinkError::TransactionInFlight
            | LinkError::Desynchronized => 15,
            LinkError::Status { .. } => 16,
            LinkError::Chunk { source, .. } => source.exit_code(),
            LinkError::Integrity(_) => 17,
        }
    }

    /// Relabel a raw read timeout with the stage the caller was in.
    pub(crate) fn at_stage(self, stage: TimeoutStage) -> Self {
        match self {
            LinkError::Timeout { after, .. } => LinkError::Timeout { stage, after },
            other => other,
        }
    }
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
