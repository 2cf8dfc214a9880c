//! Transaction engine - one request, one correlated response.
//!
//! # State machine
//!
//! ```text
//! Idle ──send──► AwaitingHeader ──10 bytes──► AwaitingPayload ──N bytes──► Idle
//!                      │                             │
//!                      └──── stream position lost ───┴──► Desynchronized
//! ```
//!
//! A call that fails with the stream still on a frame boundary returns the
//! engine to `Idle`. That covers status-level errors, undecodable JSON,
//! correlation mismatches and a header timeout before any byte arrived. In
//! the last case the request is remembered as abandoned, and a late response
//! carrying its uuid is skipped by the next call.
//!
//! A failure mid-frame leaves the engine `Desynchronized`: a partial header
//! or payload, a malformed header, an oversized declared length or a failed
//! write. Every later `send` returns [`LinkError::Desynchronized`].
//!
//! A `send` future dropped part way leaves the engine where it stopped, and
//! every later `send` fails with [`LinkError::TransactionInFlight`].

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::error::{LinkError, Result, TimeoutStage};
use crate::protocol::{build_frame, Endpoint, Header, Method, Request, Response, HEADER_SIZE};
use crate::transport::Transport;

/// Correlation ids stay below `i32::MAX` for peers that parse them as int.
const UUID_CEILING: u32 = i32::MAX as u32;

/// Span of starting points for the correlation counter.
const UUID_SEED_SPAN: u64 = 1_000_000;

/// Abandoned requests whose late responses are still recognized.
const ABANDONED_LIMIT: usize = 16;

/// Where the engine is within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingHeader,
    AwaitingPayload,
    /// The stream is no longer aligned on a frame boundary.
    Desynchronized,
}

/// Correlates requests and responses over one exclusively owned transport.
pub struct TransactionEngine<S> {
    transport: Transport<S>,
    state: EngineState,
    next_uuid: u32,
    max_payload_size: usize,
    abandoned: VecDeque<u32>,
}

impl<S> TransactionEngine<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take ownership of `transport`, accepting responses up to
    /// [`DEFAULT_MAX_PAYLOAD_SIZE`].
    pub fn new(transport: Transport<S>) -> Self {
        Self::with_max_payload(transport, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Take ownership of `transport`, rejecting larger response payloads.
    pub fn with_max_payload(transport: Transport<S>, max_payload_size: usize) -> Self {
        Self {
            transport,
            state: EngineState::Idle,
            next_uuid: seed_uuid(),
            max_payload_size,
            abandoned: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    /// Allocate the next correlation id.
    pub fn next_uuid(&mut self) -> u32 {
        let uuid = self.next_uuid;
        self.next_uuid = if uuid >= UUID_CEILING { 1 } else { uuid + 1 };
        uuid
    }

    /// Build a request with a fresh correlation id and send it.
    pub async fn request<B: Serialize>(
        &mut self,
        endpoint: Endpoint,
        method: Method,
        body: &B,
        timeout: Duration,
    ) -> Result<Response> {
        let uuid = self.next_uuid();
        let request = Request::new(endpoint, method, uuid, body)?;
        self.send(&request, timeout).await
    }

    /// Send `request` and wait for its response.
    ///
    /// `timeout` bounds each header read and each payload read separately.
    /// The response status is not inspected here.
    ///
    /// # Errors
    ///
    /// - `TransactionInFlight` if an earlier exchange was abandoned mid-call
    /// - `Desynchronized` if an earlier failure lost the frame boundary
    /// - `Timeout { stage: Header | Payload }`
    /// - `Disconnected` if the stream closes
    /// - `MalformedHeader`, `PayloadTooLarge`, `MalformedResponse`
    /// - `CorrelationMismatch` if the response carries an unknown uuid
    pub async fn send(&mut self, request: &Request, timeout: Duration) -> Result<Response> {
        match self.state {
            EngineState::Idle => {}
            EngineState::Desynchronized => return Err(LinkError::Desynchronized),
            EngineState::AwaitingHeader | EngineState::AwaitingPayload => {
                return Err(LinkError::TransactionInFlight)
            }
        }

        let result = self.exchange(request, timeout).await;
        if self.state != EngineState::Desynchronized {
            self.state = EngineState::Idle;
        }
        result
    }

    async fn exchange(&mut self, request: &Request, timeout: Duration) -> Result<Response> {
        let frame = build_frame(&request.to_payload()?)?;

        self.state = EngineState::AwaitingHeader;
        tracing::debug!(
            endpoint = %request.endpoint,
            method = %request.method,
            uuid = request.uuid,
            bytes = frame.len(),
            "sending request"
        );
        if let Err(e) = self.transport.write_all(&frame).await {
            self.lose_sync(&e);
            return Err(e);
        }

        loop {
            let response = self.read_response(request.uuid, timeout).await?;

            if response.uuid == request.uuid {
                // Anything abandoned earlier was answered before this one or
                // never will be.
                self.abandoned.clear();
                if response.endpoint != request.endpoint {
                    tracing::warn!(
                        sent = %request.endpoint,
                        echoed = %response.endpoint,
                        "response echoes a different endpoint"
                    );
                }
                return Ok(response);
            }

            match self.abandoned.iter().position(|&u| u == response.uuid) {
                Some(index) => {
                    self.abandoned.remove(index);
                    tracing::debug!(
                        uuid = response.uuid,
                        waiting_for = request.uuid,
                        "skipping late response to an abandoned request"
                    );
                    self.state = EngineState::AwaitingHeader;
                }
                None => {
                    return Err(LinkError::CorrelationMismatch {
                        expected: request.uuid,
                        received: response.uuid,
                    })
                }
            }
        }
    }

    /// Read one whole frame and decode it. `uuid` is the request waiting
    /// for it, remembered as abandoned if nothing arrives in time.
    async fn read_response(&mut self, uuid: u32, timeout: Duration) -> Result<Response> {
        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        if let Err(e) = self.transport.read_into(&mut header, HEADER_SIZE, timeout).await {
            if e.is_timeout() && header.is_empty() {
                self.abandon(uuid);
            } else {
                self.lose_sync(&e);
            }
            return Err(e.at_stage(TimeoutStage::Header));
        }

        let header = match Header::decode(&header).and_then(|h| {
            h.validate(self.max_payload_size)?;
            Ok(h)
        }) {
            Ok(header) => header,
            Err(e) => {
                self.state = EngineState::Desynchronized;
                return Err(e);
            }
        };

        self.state = EngineState::AwaitingPayload;
        let payload = match self
            .transport
            .read_exact(header.payload_length, timeout)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                self.lose_sync(&e);
                return Err(e.at_stage(TimeoutStage::Payload));
            }
        };

        // The frame was consumed whole, so a bad payload leaves the stream
        // aligned.
        let response = Response::from_payload(&payload)?;
        tracing::debug!(
            endpoint = %response.endpoint,
            status = response.status.0,
            uuid = response.uuid,
            bytes = payload.len(),
            "received response"
        );
        Ok(response)
    }

    fn abandon(&mut self, uuid: u32) {
        if self.abandoned.len() == ABANDONED_LIMIT {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(uuid);
        tracing::debug!(uuid, "request abandoned after header timeout");
    }

    /// A closed stream keeps reporting `Disconnected` on its own.
    fn lose_sync(&mut self, cause: &LinkError) {
        if !matches!(cause, LinkError::Disconnected) {
            tracing::warn!(error = %cause, "stream position lost");
            self.state = EngineState::Desynchronized;
        }
    }

    /// Close the transport. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

/// Starting point for the correlation counter, from the clock and process id.
fn seed_uuid() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let mixed = nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ pid;

    (mixed % UUID_SEED_SPAN) as u32 + 1
}
