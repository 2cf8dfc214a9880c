//! # desklink
//!
//! Host-side transport core for driving a phone over its USB serial
//! "desktop" link.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): `#` + 9 decimal digits + UTF-8 JSON
//! - **Transport** ([`transport`]): exclusive byte stream, device open and
//!   discovery
//! - **Transaction engine** ([`engine`]): one request, one correlated
//!   response, no retries
//! - **Chunked transfers** ([`transfer`]): CRC-32 verified downloads and
//!   uploads through the `filesystem` endpoint
//! - **Task poller** ([`poller`]): backup/restore style tasks polled to a
//!   terminal state
//! - **Session** ([`Session`]): owns one transport, built by [`SessionBuilder`]
//!
//! ## Example
//!
//! ```
//! use desklink::emulator::DeviceEmulator;
//! use desklink::SessionBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> desklink::Result<()> {
//! let emulator = DeviceEmulator::builder()
//!     .chunk_size(1000)
//!     .file("/sys/user/logs.txt", vec![b'x'; 2500])
//!     .build();
//!
//! let mut session = SessionBuilder::new().attach(emulator.connect());
//! let download = session.download("/sys/user/logs.txt").await?;
//! assert_eq!(download.session.total_chunks, 3);
//! assert!(download.verified);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod emulator;
pub mod engine;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod transfer;
pub mod transport;

mod client;

pub use client::{Session, SessionBuilder};
pub use config::LinkConfig;
pub use error::{LinkError, Result};
pub use poller::{PollPolicy, TaskHandle, TaskOutcome};
