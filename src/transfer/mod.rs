//! Chunked transfer engine - files larger than one frame.
//!
//! # Download
//!
//! ```text
//! GET {fileName}        ──► {rxID, fileSize, chunkSize, fileCrc32?}
//! GET {rxID, chunkNo=1} ──► {rxID, chunkNo, data}
//! ...
//! GET {rxID, chunkNo=N} ──► {rxID, chunkNo, data, fileCrc32}
//! ```
//!
//! # Upload
//!
//! ```text
//! PUT {fileName, fileSize, fileCrc32} ──► {txID, chunkSize}
//! PUT {txID, chunkNo, data}           ──► {txID, chunkNo}   (N times)
//! ```
//!
//! Chunks go strictly in order, one transaction each. The first failing
//! chunk aborts the transfer; nothing is retried. Chunk `data` is exact
//! base64 (see [`ChunkCodec`]).

pub mod wire;

use std::ops::Range;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{ChunkCodec, Crc32};
use crate::engine::TransactionEngine;
use crate::error::{Direction, IntegrityFailure, LinkError, Result};
use crate::protocol::{Endpoint, Method};
use wire::{
    ChunkAck, ChunkData, ChunkFetch, ChunkUpload, DirEntry, FileInfo, FileInfoRequest, ListDir,
    RemoveFile, UploadGrant, UploadRequest,
};

/// Upper bound on memory reserved up front for a download.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

/// One granted transfer: the peer's id plus the chunk geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub direction: Direction,
    /// `rxID` for downloads, `txID` for uploads.
    pub id: u32,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub expected_checksum: Option<Crc32>,
}

impl TransferSession {
    /// Build a session from the peer's grant.
    ///
    /// # Errors
    ///
    /// `MalformedResponse` for a zero chunk size with a non-empty file, or a
    /// chunk count that does not fit `u32`.
    pub fn new(
        direction: Direction,
        id: u32,
        total_size: u64,
        chunk_size: u64,
        expected_checksum: Option<Crc32>,
    ) -> Result<Self> {
        let total_chunks = match (total_size, chunk_size) {
            (0, _) => 0,
            (_, 0) => {
                return Err(LinkError::MalformedResponse(format!(
                    "{direction} grant {id}: chunkSize is 0 for a {total_size} byte file"
                )))
            }
            (size, chunk) => size.div_ceil(chunk),
        };
        let total_chunks = u32::try_from(total_chunks).map_err(|_| {
            LinkError::MalformedResponse(format!(
                "{direction} grant {id}: {total_chunks} chunks is out of range"
            ))
        })?;

        Ok(Self {
            direction,
            id,
            total_size,
            chunk_size,
            total_chunks,
            expected_checksum,
        })
    }

    /// Byte range of `chunk_no` (1-based) within the file.
    pub fn chunk_range(&self, chunk_no: u32) -> Range<usize> {
        let start = u64::from(chunk_no.saturating_sub(1)).saturating_mul(self.chunk_size);
        let end = start.saturating_add(self.chunk_size).min(self.total_size);
        let start = start.min(self.total_size);
        start as usize..end as usize
    }

    fn chunk_error(&self, chunk_no: u32, source: LinkError) -> LinkError {
        LinkError::Chunk {
            direction: self.direction,
            chunk_no,
            total_chunks: self.total_chunks,
            source: Box::new(source),
        }
    }
}

/// One decoded download chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChunk {
    pub chunk_no: u32,
    pub data: Vec<u8>,
    /// Whole-file checksum, when the peer attached one to this chunk.
    pub checksum: Option<Crc32>,
}

/// A completed download.
#[derive(Debug, Clone)]
pub struct Download {
    pub session: TransferSession,
    pub data: Vec<u8>,
    /// CRC-32 computed over `data`.
    pub checksum: Crc32,
    /// Whether the peer supplied a checksum to compare against.
    pub verified: bool,
}

/// A completed upload.
#[derive(Debug, Clone)]
pub struct Upload {
    pub session: TransferSession,
    /// CRC-32 announced to the peer.
    pub checksum: Crc32,
}

/// Chunked transfers over a borrowed transaction engine.
///
/// `timeout` bounds each read of each chunk transaction.
pub struct ChunkedTransfer<'e, S> {
    engine: &'e mut TransactionEngine<S>,
    timeout: Duration,
}

impl<'e, S> ChunkedTransfer<'e, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(engine: &'e mut TransactionEngine<S>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Ask the peer for a download grant for `file_name`.
    pub async fn open_download(&mut self, file_name: &str) -> Result<TransferSession> {
        let request = FileInfoRequest {
            file_name: file_name.to_string(),
        };
        let info: FileInfo = self
            .engine
            .request(Endpoint::FILESYSTEM, Method::Get, &request, self.timeout)
            .await?
            .require_success(&format!("download of {file_name}"))?
            .body_as()?;

        let expected = info.file_crc32.as_deref().map(str::parse::<Crc32>).transpose()?;
        let session = TransferSession::new(
            Direction::Download,
            info.rx_id,
            info.file_size,
            info.chunk_size,
            expected,
        )?;

        tracing::debug!(
            file = file_name,
            rx_id = session.id,
            size = session.total_size,
            chunks = session.total_chunks,
            "download granted"
        );
        Ok(session)
    }

    /// Fetch one chunk. No bounds checking happens here: out-of-range
    /// numbers and foreign ids go to the peer, which rejects them.
    pub async fn fetch_chunk(&mut self, rx_id: u32, chunk_no: u32) -> Result<FetchedChunk> {
        let chunk: ChunkData = self
            .engine
            .request(
                Endpoint::FILESYSTEM,
                Method::Get,
                &ChunkFetch { rx_id, chunk_no },
                self.timeout,
            )
            .await?
            .require_success("chunk fetch")?
            .body_as()?;

        if chunk.rx_id != rx_id || chunk.chunk_no != chunk_no {
            return Err(LinkError::MalformedResponse(format!(
                "asked for rxID {rx_id} chunk {chunk_no}, got rxID {} chunk {}",
                chunk.rx_id, chunk.chunk_no
            )));
        }

        Ok(FetchedChunk {
            chunk_no,
            data: ChunkCodec::decode(&chunk.data)?,
            checksum: chunk.file_crc32.as_deref().map(str::parse::<Crc32>).transpose()?,
        })
    }

    /// Download `file_name` completely and verify it.
    ///
    /// # Errors
    ///
    /// - whatever [`open_download`](Self::open_download) returns
    /// - `Chunk { .. }` wrapping the first failed chunk transaction
    /// - `Integrity(Length)` if the assembled size differs from `fileSize`
    /// - `Integrity(Checksum)` if a peer checksum is known and differs
    pub async fn download(&mut self, file_name: &str) -> Result<Download> {
        let mut session = self.open_download(file_name).await?;
        let capacity = usize::try_from(session.total_size)
            .unwrap_or(MAX_PREALLOC)
            .min(MAX_PREALLOC);
        let mut data = Vec::with_capacity(capacity);

        for chunk_no in 1..=session.total_chunks {
            let chunk = self
                .fetch_chunk(session.id, chunk_no)
                .await
                .map_err(|e| session.chunk_error(chunk_no, e))?;
            data.extend_from_slice(&chunk.data);

            match (session.expected_checksum, chunk.checksum) {
                (None, Some(crc)) => session.expected_checksum = Some(crc),
                (Some(known), Some(crc)) if known != crc => {
                    tracing::warn!(
                        rx_id = session.id,
                        chunk_no,
                        announced = %known,
                        attached = %crc,
                        "chunk carries a different file checksum, keeping the first"
                    );
                }
                _ => {}
            }
            tracing::debug!(
                rx_id = session.id,
                chunk_no,
                total = session.total_chunks,
                received = data.len(),
                "chunk received"
            );
        }

        let actual_len = data.len() as u64;
        if actual_len != session.total_size {
            return Err(LinkError::Integrity(IntegrityFailure::Length {
                expected: session.total_size,
                actual: actual_len,
            }));
        }

        let checksum = Crc32::of(&data);
        if let Some(expected) = session.expected_checksum {
            if expected != checksum {
                return Err(LinkError::Integrity(IntegrityFailure::Checksum {
                    expected: expected.0,
                    actual: checksum.0,
                }));
            }
        }

        Ok(Download {
            verified: session.expected_checksum.is_some(),
            session,
            data,
            checksum,
        })
    }

    /// Announce an upload of `data` as `file_name`.
    pub async fn open_upload(&mut self, file_name: &str, data: &[u8]) -> Result<TransferSession> {
        let checksum = Crc32::of(data);
        let request = UploadRequest {
            file_name: file_name.to_string(),
            file_size: data.len() as u64,
            file_crc32: checksum.to_hex(),
        };
        let grant: UploadGrant = self
            .engine
            .request(Endpoint::FILESYSTEM, Method::Put, &request, self.timeout)
            .await?
            .require_success(&format!("upload of {file_name}"))?
            .body_as()?;

        let session = TransferSession::new(
            Direction::Upload,
            grant.tx_id,
            request.file_size,
            grant.chunk_size,
            Some(checksum),
        )?;

        tracing::debug!(
            file = file_name,
            tx_id = session.id,
            size = session.total_size,
            chunks = session.total_chunks,
            "upload granted"
        );
        Ok(session)
    }

    /// Send one chunk. As with [`fetch_chunk`](Self::fetch_chunk), the peer
    /// is the one enforcing ids and ordering.
    pub async fn send_chunk(&mut self, tx_id: u32, chunk_no: u32, data: &[u8]) -> Result<()> {
        let request = ChunkUpload {
            tx_id,
            chunk_no,
            data: ChunkCodec::encode(data),
        };
        let ack: ChunkAck = self
            .engine
            .request(Endpoint::FILESYSTEM, Method::Put, &request, self.timeout)
            .await?
            .require_success("chunk upload")?
            .body_as()?;

        if ack.chunk_no.is_some_and(|n| n != chunk_no) || ack.tx_id.is_some_and(|id| id != tx_id)
        {
            return Err(LinkError::MalformedResponse(format!(
                "sent txID {tx_id} chunk {chunk_no}, acknowledged {ack:?}"
            )));
        }
        Ok(())
    }

    /// Upload `data` as `file_name`, chunk by chunk.
    pub async fn upload(&mut self, file_name: &str, data: &[u8]) -> Result<Upload> {
        let session = self.open_upload(file_name, data).await?;

        for chunk_no in 1..=session.total_chunks {
            let range = session.chunk_range(chunk_no);
            self.send_chunk(session.id, chunk_no, &data[range])
                .await
                .map_err(|e| session.chunk_error(chunk_no, e))?;
            tracing::debug!(
                tx_id = session.id,
                chunk_no,
                total = session.total_chunks,
                "chunk sent"
            );
        }

        Ok(Upload {
            checksum: Crc32::of(data),
            session,
        })
    }

    /// Delete `file_name` on the device.
    pub async fn remove_file(&mut self, file_name: &str) -> Result<()> {
        let request = RemoveFile {
            remove_file: file_name.to_string(),
        };
        self.engine
            .request(Endpoint::FILESYSTEM, Method::Delete, &request, self.timeout)
            .await?
            .require_success(&format!("removal of {file_name}"))?;
        Ok(())
    }

    /// Entries directly under `dir`. A missing directory is `Status(404)`.
    pub async fn list_dir(&mut self, dir: &str) -> Result<Vec<DirEntry>> {
        let request = ListDir {
            list_dir: dir.to_string(),
        };
        let mut response = self
            .engine
            .request(Endpoint::FILESYSTEM, Method::Get, &request, self.timeout)
            .await?
            .require_success(&format!("listing of {dir}"))?;

        let entries = response
            .body
            .get_mut(dir)
            .map(serde_json::Value::take)
            .ok_or_else(|| LinkError::MalformedResponse(format!("listing carries no {dir} key")))?;
        serde_json::from_value(entries)
            .map_err(|e| LinkError::MalformedResponse(format!("listing of {dir}: {e}")))
    }
}
