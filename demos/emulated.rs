//! Exercise the whole stack against the in-process emulator.
//!
//! ```text
//! RUST_LOG=debug cargo run --example emulated
//! ```

use std::time::Duration;

use desklink::emulator::{DeviceEmulator, Fault, TaskScript};
use desklink::protocol::{Endpoint, Method, Status};
use desklink::{PollPolicy, SessionBuilder};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> desklink::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let log: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let emulator = DeviceEmulator::builder()
        .chunk_size(4096)
        .file("/sys/user/logs/MuditaOS.log", log.clone())
        .task_template(
            Endpoint::BACKUP,
            TaskScript::new()
                .running(2)
                .finished()
                .finished_status(Status::SEE_OTHER),
        )
        .fault(Fault::CorruptChunk { chunk_no: 7 })
        .build();

    let mut session = SessionBuilder::new()
        .poll_policy(PollPolicy::new(
            Duration::from_millis(200),
            Duration::from_secs(5),
        ))
        .attach(emulator.connect());

    let info = session
        .request(Endpoint::DEVICE_INFO, Method::Get, &())
        .await?;
    println!("device info: {}", info.body);

    match session.download("/sys/user/logs/MuditaOS.log").await {
        Ok(download) => println!("downloaded {} bytes", download.data.len()),
        Err(e) => println!("download rejected as expected: {e}"),
    }

    let upload = session.upload("/sys/user/music/tone.bin", &log).await?;
    println!(
        "uploaded {} chunks, crc {}",
        upload.session.total_chunks, upload.checksum
    );

    let (task, outcome) = session.run_task(Endpoint::BACKUP, &()).await?;
    println!("{task}: {outcome:?}");

    session.close().await
}
