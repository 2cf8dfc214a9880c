//! Exclusive owner of one byte stream.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use desklink::transport::Transport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> desklink::Result<()> {
//! let (host, mut device) = tokio::io::duplex(64);
//! let mut transport = Transport::new(host, "duplex");
//!
//! tokio::io::AsyncWriteExt::write_all(&mut device, b"#000000002{}").await?;
//! let header = transport.read_exact(10, Duration::from_secs(1)).await?;
//! assert_eq!(&header[..], b"#000000002");
//! transport.close().await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::io::ErrorKind;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LinkError, Result, TimeoutStage};

/// Largest single allocation step while waiting for a long read.
const READ_STEP: usize = 64 * 1024;

/// A byte stream with timeout-bounded exact reads and full writes.
///
/// The stream is released on [`close`](Transport::close) or on drop,
/// whichever comes first.
pub struct Transport<S> {
    stream: Option<S>,
    label: String,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an open stream. `label` names it in logs and errors.
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            label: label.into(),
        }
    }

    /// Name of the underlying device or stream.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Check whether the stream is still held.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Read exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// - `Timeout { stage: Read }` if `timeout` elapses first
    /// - `Disconnected` on end of stream, or if the transport is closed
    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.read_into(&mut buf, n, timeout).await?;
        Ok(buf.freeze())
    }

    /// Append bytes to `buf` until it holds `n`; same outcomes as
    /// [`read_exact`](Self::read_exact).
    ///
    /// Memory grows with what actually arrives, not with `n`. On error `buf`
    /// keeps whatever was consumed from the stream before the failure.
    pub async fn read_into(&mut self, buf: &mut BytesMut, n: usize, timeout: Duration) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(LinkError::Disconnected)?;

        match tokio::time::timeout(timeout, fill(stream, buf, n)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(map_io(e)),
            Err(_) => Err(LinkError::Timeout {
                stage: TimeoutStage::Read,
                after: timeout,
            }),
        }
    }

    /// Write the whole buffer and flush it.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(LinkError::Disconnected)?;

        stream.write_all(bytes).await.map_err(map_io)?;
        stream.flush().await.map_err(map_io)
    }

    /// Release the stream. Calling this again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        tracing::debug!(device = %self.label, "closing transport");

        match stream.shutdown().await {
            Ok(()) => Ok(()),
            // The peer going first is not a close failure.
            Err(e) if is_disconnect(&e) => Ok(()),
            Err(e) => Err(LinkError::Io(e)),
        }
    }
}

async fn fill<S>(stream: &mut S, buf: &mut BytesMut, n: usize) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < n {
        let wanted = n - buf.len();
        buf.reserve(wanted.min(READ_STEP));
        let read = (&mut *stream).take(wanted as u64).read_buf(buf).await?;
        if read == 0 {
            return Err(ErrorKind::UnexpectedEof.into());
        }
    }
    Ok(())
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}

fn map_io(e: std::io::Error) -> LinkError {
    if is_disconnect(&e) {
        LinkError::Disconnected
    } else {
        LinkError::Io(e)
    }
}
