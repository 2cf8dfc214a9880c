//! Download one file from a connected phone.
//!
//! ```text
//! cargo run --example download -- /sys/user/logs/MuditaOS.log ./MuditaOS.log [/dev/ttyACM0]
//! ```
//!
//! Without a device path the phone is discovered by USB id. On failure the
//! process exits with the error's exit code.

use std::time::Duration;

use desklink::{LinkError, Session};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(remote), Some(local)) = (args.first(), args.get(1)) else {
        eprintln!("usage: download <remote-file> <local-file> [device]");
        std::process::exit(2);
    };

    if let Err(e) = run(remote, local, args.get(2)).await {
        eprintln!("download failed: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(remote: &str, local: &str, device: Option<&String>) -> Result<(), LinkError> {
    let builder = Session::builder().chunk_timeout(Duration::from_secs(15));
    let mut session = match device {
        Some(path) => builder.open(path).await?,
        None => builder.discover_with_retry(Duration::from_secs(10)).await?,
    };

    let download = session.download(remote).await?;
    tokio::fs::write(local, &download.data).await?;

    tracing::info!(
        bytes = download.data.len(),
        chunks = download.session.total_chunks,
        crc = %download.checksum,
        verified = download.verified,
        "download complete"
    );
    session.close().await
}
