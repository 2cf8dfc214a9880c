//! Link configuration with documented defaults.

use std::time::Duration;

use crate::poller::PollPolicy;

/// Default timeout for one request/response exchange.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for each chunk exchange of a bulk transfer.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between task status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default overall deadline for a polled task.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a response payload.
///
/// The largest regular response is a 12 KiB transfer chunk in base64; the
/// 9-digit header allows close to 1 GB, which a corrupted length would
/// otherwise claim.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Default interval between discovery attempts.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration shared by every layer of one session.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound on each header/payload read of a plain transaction.
    pub transaction_timeout: Duration,
    /// Bound on each header/payload read of a chunk transaction.
    pub chunk_timeout: Duration,
    /// Task polling cadence and deadline.
    pub poll: PollPolicy,
    /// Largest response payload accepted from the device.
    pub max_payload_size: usize,
    /// Wait between attempts in `discover_with_retry`.
    pub discovery_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            poll: PollPolicy::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
        }
    }
}
