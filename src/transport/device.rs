//! Serial character device open.
//!
//! The phone enumerates as a USB CDC-ACM tty. A tty starts out in canonical
//! mode with echo, which would hold reads until a newline and bounce every
//! byte back to the phone, so the line is switched to raw mode on open.
//! Baud rate and parity mean nothing on CDC-ACM and are left alone.

use std::io::ErrorKind;
use std::path::Path;

use tokio::fs::OpenOptions;

use super::Transport;
use crate::error::{LinkError, Result};

/// Stream type backing a device transport.
pub type DeviceStream = tokio::fs::File;

/// Open the device node at `path` and put it in raw mode.
///
/// Nodes that are not terminals (plain files, FIFOs) are opened as they are.
///
/// # Errors
///
/// - `NotFound` if nothing exists at `path`
/// - `DeviceUnavailable` if it exists but cannot be opened (permissions,
///   held by another process) or its line settings cannot be changed
pub async fn open(path: impl AsRef<Path>) -> Result<Transport<DeviceStream>> {
    let path = path.as_ref();
    let label = path.display().to_string();

    let mut options = OpenOptions::new();
    options.read(true).write(true);
    #[cfg(unix)]
    options.custom_flags(libc::O_NOCTTY);

    let file = options.open(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => LinkError::NotFound(label.clone()),
        _ => LinkError::DeviceUnavailable {
            path: label.clone(),
            source: e,
        },
    })?;

    #[cfg(unix)]
    {
        let raw = termios::make_raw(&file).map_err(|e| LinkError::DeviceUnavailable {
            path: label.clone(),
            source: e,
        })?;
        tracing::debug!(device = %label, tty = raw, "opened device");
    }
    #[cfg(not(unix))]
    tracing::debug!(device = %label, "opened device");

    Ok(Transport::new(file, label))
}

#[cfg(unix)]
mod termios {
    use std::io;
    use std::mem::MaybeUninit;
    use std::os::unix::io::AsRawFd;

    /// Switch a terminal to raw 8-bit mode with blocking single-byte reads
    /// and drop anything it queued before we owned it. Returns whether `fd`
    /// was a terminal at all.
    pub(super) fn make_raw(file: &impl AsRawFd) -> io::Result<bool> {
        let fd = file.as_raw_fd();

        // SAFETY: `fd` is borrowed from an open file for the whole call.
        if unsafe { libc::isatty(fd) } != 1 {
            return Ok(false);
        }

        let mut attrs = MaybeUninit::<libc::termios>::uninit();
        // SAFETY: tcgetattr fully initializes `attrs` when it returns 0.
        if unsafe { libc::tcgetattr(fd, attrs.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: checked above.
        let mut attrs = unsafe { attrs.assume_init() };

        // SAFETY: `attrs` is a valid termios.
        unsafe { libc::cfmakeraw(&mut attrs) };
        attrs.c_cc[libc::VMIN] = 1;
        attrs.c_cc[libc::VTIME] = 0;

        // SAFETY: `fd` is open and `attrs` is a valid termios.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &attrs) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is open.
        if unsafe { libc::tcflush(fd, libc::TCIOFLUSH) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(dir.path().join("ttyACM9")).await.err().unwrap();
        assert!(matches!(err, LinkError::NotFound(_)));
        assert_eq!(err.exit_code(), 10);
    }

    #[tokio::test]
    async fn test_open_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(dir.path()).await.err().unwrap();
        assert!(matches!(err, LinkError::DeviceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_open_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut transport = open(file.path()).await.unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.label(), file.path().display().to_string());
        transport.close().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    mod pty {
        use std::ffi::CStr;
        use std::fs::File;
        use std::io::{ErrorKind, Read, Write};
        use std::os::unix::io::FromRawFd;
        use std::path::PathBuf;
        use std::time::Duration;

        use super::super::open;

        /// Allocate a pseudo-terminal pair: the controller side as a file
        /// and the path of the terminal side.
        fn openpty() -> (File, PathBuf) {
            unsafe {
                let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
                assert!(fd >= 0, "posix_openpt: {}", std::io::Error::last_os_error());
                assert_eq!(libc::grantpt(fd), 0);
                assert_eq!(libc::unlockpt(fd), 0);

                let mut name = [0 as libc::c_char; 128];
                assert_eq!(libc::ptsname_r(fd, name.as_mut_ptr(), name.len()), 0);
                let path = CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned();
                (File::from_raw_fd(fd), PathBuf::from(path))
            }
        }

        fn set_nonblocking(file: &File) {
            use std::os::unix::io::AsRawFd;
            unsafe {
                let fd = file.as_raw_fd();
                let flags = libc::fcntl(fd, libc::F_GETFL);
                assert_eq!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
            }
        }

        #[tokio::test]
        async fn test_tty_frames_arrive_without_newline() {
            let (mut phone, tty) = openpty();
            let mut transport = open(&tty).await.unwrap();

            phone.write_all(b"#000000002{}").unwrap();
            let frame = transport
                .read_exact(12, Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(&frame[..], b"#000000002{}");
        }

        #[tokio::test]
        async fn test_tty_does_not_echo_to_phone() {
            let (mut phone, tty) = openpty();
            let mut transport = open(&tty).await.unwrap();

            transport.write_all(b"#000000000").await.unwrap();
            let mut request = [0u8; 10];
            phone.read_exact(&mut request).unwrap();
            assert_eq!(&request, b"#000000000");

            phone.write_all(b"#000000002{}").unwrap();
            transport
                .read_exact(12, Duration::from_secs(2))
                .await
                .unwrap();

            set_nonblocking(&phone);
            let mut echoed = [0u8; 16];
            let err = phone.read(&mut echoed).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WouldBlock);
        }
    }
}
