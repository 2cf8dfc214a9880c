//! Session builder and session.
//!
//! The [`SessionBuilder`] carries configuration and produces a [`Session`]
//! by one of:
//! 1. `open(path)` - a known device node
//! 2. `discover()` / `discover_with_retry(timeout)` - find the phone by USB id
//! 3. `attach(transport)` - any stream, such as the emulator
//!
//! A `Session` exclusively owns one transport and its transaction engine.
//! Dropping it releases the device on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use desklink::protocol::Endpoint;
//! use desklink::{Session, TaskOutcome};
//!
//! #[tokio::main]
//! async fn main() -> desklink::Result<()> {
//!     let mut session = Session::builder()
//!         .transaction_timeout(std::time::Duration::from_secs(3))
//!         .discover()
//!         .await?;
//!
//!     let logs = session.download("/sys/user/logs/MuditaOS.log").await?;
//!     println!("{} bytes, crc {}", logs.data.len(), logs.checksum);
//!
//!     let (task, outcome) = session.run_task(Endpoint::BACKUP, &()).await?;
//!     if let TaskOutcome::Failed { reason } = outcome {
//!         eprintln!("{task} failed: {reason:?}");
//!     }
//!
//!     session.close().await
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::config::LinkConfig;
use crate::engine::TransactionEngine;
use crate::error::{LinkError, Result, TimeoutStage};
use crate::poller::{PollPolicy, TaskHandle, TaskOutcome, TaskPoller};
use crate::protocol::{Endpoint, Method, Request, Response};
use crate::transfer::wire::DirEntry;
use crate::transfer::{ChunkedTransfer, Download, Upload};
use crate::transport::{self, find_device, DeviceFilter, DeviceStream, Transport};

/// Builder for configuring and opening a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: LinkConfig,
    filter: DeviceFilter,
}

impl SessionBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound on each read of a plain transaction.
    ///
    /// Default: 5 seconds
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_timeout = timeout;
        self
    }

    /// Bound on each read of a chunk transaction.
    ///
    /// Default: 10 seconds
    pub fn chunk_timeout(mut self, timeout: Duration) -> Self {
        self.config.chunk_timeout = timeout;
        self
    }

    /// Task polling cadence and deadline.
    ///
    /// Default: every 1 second for up to 30 seconds
    pub fn poll_policy(mut self, policy: PollPolicy) -> Self {
        self.config.poll = policy;
        self
    }

    /// Largest response payload accepted.
    ///
    /// Default: 1 MiB. The wire format allows up to 999,999,999 bytes.
    pub fn max_payload_size(mut self, limit: usize) -> Self {
        self.config.max_payload_size = limit;
        self
    }

    /// Which USB device `discover` looks for.
    ///
    /// Default: the phone's vendor/product id under `/sys`
    pub fn device_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Wait between attempts of `discover_with_retry`.
    ///
    /// Default: 500 milliseconds
    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.config.discovery_interval = interval;
        self
    }

    /// Open the device node at `path`.
    pub async fn open(self, path: impl AsRef<Path>) -> Result<Session<DeviceStream>> {
        let transport = transport::open(path).await?;
        Ok(self.attach(transport))
    }

    /// Find the device by USB id and open it. One attempt.
    ///
    /// The sysfs walk runs on tokio's blocking pool.
    pub async fn discover(self) -> Result<Session<DeviceStream>> {
        let path = locate(&self.filter).await?;
        self.open(path).await
    }

    /// Retry [`discover`](Self::discover) until it succeeds or `timeout`
    /// elapses. Only "not there yet" failures are retried.
    pub async fn discover_with_retry(self, timeout: Duration) -> Result<Session<DeviceStream>> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let outcome = match locate(&self.filter).await {
                Ok(path) => transport::open(path).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(transport) => {
                    tracing::debug!(device = %transport.label(), attempts, "device discovered");
                    return Ok(self.attach(transport));
                }
                Err(e) if is_retryable_discovery(&e) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        tracing::debug!(attempts, error = %e, "giving up on discovery");
                        return Err(LinkError::Timeout {
                            stage: TimeoutStage::Discovery,
                            after: timeout,
                        });
                    }
                    let remaining = timeout - elapsed;
                    tokio::time::sleep(self.config.discovery_interval.min(remaining)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wrap an already open transport.
    pub fn attach<S>(self, transport: Transport<S>) -> Session<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Session {
            engine: TransactionEngine::with_max_payload(transport, self.config.max_payload_size),
            config: self.config,
        }
    }
}

/// [`find_device`] reads sysfs with blocking `std::fs` calls.
async fn locate(filter: &DeviceFilter) -> Result<PathBuf> {
    let filter = filter.clone();
    tokio::task::spawn_blocking(move || find_device(&filter))
        .await
        .map_err(|e| LinkError::Io(std::io::Error::other(e)))?
}

fn is_retryable_discovery(e: &LinkError) -> bool {
    matches!(
        e,
        LinkError::NotFound(_) | LinkError::MalformedDevice { .. } | LinkError::DeviceUnavailable { .. }
    )
}

/// One open link to one device.
pub struct Session<S = DeviceStream> {
    engine: TransactionEngine<S>,
    config: LinkConfig,
}

impl Session<DeviceStream> {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Name of the underlying device.
    pub fn label(&self) -> &str {
        self.engine.transport().label()
    }

    /// The transaction engine, for callers that manage timeouts themselves.
    pub fn engine(&mut self) -> &mut TransactionEngine<S> {
        &mut self.engine
    }

    /// One transaction with the configured timeout and a fresh uuid.
    pub async fn request<B: Serialize>(
        &mut self,
        endpoint: Endpoint,
        method: Method,
        body: &B,
    ) -> Result<Response> {
        self.engine
            .request(endpoint, method, body, self.config.transaction_timeout)
            .await
    }

    /// Send a prepared request with the configured timeout.
    pub async fn send(&mut self, request: &Request) -> Result<Response> {
        self.engine
            .send(request, self.config.transaction_timeout)
            .await
    }

    /// Chunked transfer helper bound to the chunk timeout.
    pub fn transfer(&mut self) -> ChunkedTransfer<'_, S> {
        ChunkedTransfer::new(&mut self.engine, self.config.chunk_timeout)
    }

    pub async fn download(&mut self, file_name: &str) -> Result<Download> {
        self.transfer().download(file_name).await
    }

    pub async fn upload(&mut self, file_name: &str, data: &[u8]) -> Result<Upload> {
        self.transfer().upload(file_name, data).await
    }

    pub async fn remove_file(&mut self, file_name: &str) -> Result<()> {
        self.transfer().remove_file(file_name).await
    }

    pub async fn list_dir(&mut self, dir: &str) -> Result<Vec<DirEntry>> {
        self.transfer().list_dir(dir).await
    }

    /// Task poller bound to the configured policy.
    pub fn poller(&mut self) -> TaskPoller<'_, S> {
        TaskPoller::new(
            &mut self.engine,
            self.config.poll,
            self.config.transaction_timeout,
        )
    }

    pub async fn start_task<B: Serialize>(
        &mut self,
        endpoint: Endpoint,
        body: &B,
    ) -> Result<TaskHandle> {
        self.poller().start(endpoint, body).await
    }

    pub async fn wait_for_task(&mut self, task: &TaskHandle) -> Result<TaskOutcome> {
        self.poller().poll_until_terminal(task).await
    }

    /// Start a task and poll it to the end.
    pub async fn run_task<B: Serialize>(
        &mut self,
        endpoint: Endpoint,
        body: &B,
    ) -> Result<(TaskHandle, TaskOutcome)> {
        let mut poller = self.poller();
        let task = poller.start(endpoint, body).await?;
        let outcome = poller.poll_until_terminal(&task).await?;
        Ok((task, outcome))
    }

    /// Release the device. Idempotent; dropping the session also releases it.
    pub async fn close(&mut self) -> Result<()> {
        self.engine.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{DeviceEmulator, TaskScript};
    use crate::protocol::Status;

    #[test]
    fn test_builder_configuration() {
        let builder = Session::builder()
            .transaction_timeout(Duration::from_secs(2))
            .chunk_timeout(Duration::from_secs(20))
            .poll_policy(PollPolicy::new(
                Duration::from_millis(250),
                Duration::from_secs(60),
            ))
            .max_payload_size(1024)
            .discovery_interval(Duration::from_secs(1));

        assert_eq!(builder.config.transaction_timeout, Duration::from_secs(2));
        assert_eq!(builder.config.chunk_timeout, Duration::from_secs(20));
        assert_eq!(builder.config.poll.interval, Duration::from_millis(250));
        assert_eq!(builder.config.poll.timeout, Duration::from_secs(60));
        assert_eq!(builder.config.max_payload_size, 1024);
        assert_eq!(builder.config.discovery_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_default() {
        let builder = SessionBuilder::default();
        assert_eq!(builder.filter.vendor_id, crate::transport::DEFAULT_VENDOR_ID);
        assert_eq!(
            builder.config.transaction_timeout,
            crate::config::DEFAULT_TRANSACTION_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_attached_session_round_trip() {
        let emulator = DeviceEmulator::builder().file("f", vec![7u8; 40]).build();
        let mut session = SessionBuilder::new().attach(emulator.connect());
        assert_eq!(session.label(), "emulator");

        let info = session
            .request(Endpoint::DEVICE_INFO, Method::Get, &())
            .await
            .unwrap();
        assert_eq!(info.status, Status::OK);

        let download = session.download("f").await.unwrap();
        assert_eq!(download.data, vec![7u8; 40]);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.request(Endpoint::DEVICE_INFO, Method::Get, &()).await,
            Err(LinkError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_task() {
        let emulator = DeviceEmulator::builder()
            .task_template(Endpoint::BACKUP, TaskScript::new().running(3).finished())
            .build();
        let mut session = SessionBuilder::new().attach(emulator.connect());

        let (task, outcome) = session.run_task(Endpoint::BACKUP, &()).await.unwrap();
        assert_eq!(task.endpoint, Endpoint::BACKUP);
        assert!(outcome.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_with_retry_times_out() {
        let sysfs = tempfile::tempdir().unwrap();
        let builder = SessionBuilder::new()
            .device_filter(DeviceFilter::default().sysfs_root(sysfs.path()))
            .discovery_interval(Duration::from_millis(100));

        let begin = Instant::now();
        let err = builder
            .discover_with_retry(Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LinkError::Timeout {
                stage: TimeoutStage::Discovery,
                ..
            }
        ));
        assert_eq!(begin.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_discover_without_device_is_not_found() {
        let sysfs = tempfile::tempdir().unwrap();
        let err = SessionBuilder::new()
            .device_filter(DeviceFilter::default().sysfs_root(sysfs.path()))
            .discover()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discover_opens_matching_node() {
        use std::fs;

        let sysfs = tempfile::tempdir().unwrap();
        let dev = tempfile::tempdir().unwrap();
        let usb = sysfs.path().join("devices").join("1-1");
        fs::create_dir_all(usb.join("1-1:1.0")).unwrap();
        fs::write(usb.join("idVendor"), "3310\n").unwrap();
        fs::write(usb.join("idProduct"), "0100\n").unwrap();
        let class = sysfs.path().join("class").join("tty").join("ttyACM0");
        fs::create_dir_all(&class).unwrap();
        std::os::unix::fs::symlink(usb.join("1-1:1.0"), class.join("device")).unwrap();
        fs::write(dev.path().join("ttyACM0"), b"").unwrap();

        let session = SessionBuilder::new()
            .device_filter(
                DeviceFilter::default()
                    .sysfs_root(sysfs.path())
                    .dev_root(dev.path()),
            )
            .discover_with_retry(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(session.label().ends_with("ttyACM0"));
    }
}
