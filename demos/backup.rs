//! Run a device backup and wait for it to finish.
//!
//! ```text
//! RUST_LOG=desklink=debug cargo run --example backup
//! ```

use std::time::Duration;

use desklink::protocol::Endpoint;
use desklink::{PollPolicy, Session, TaskOutcome};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let code = match run().await {
        Ok(TaskOutcome::Finished { body }) => {
            println!("backup finished: {body}");
            0
        }
        Ok(TaskOutcome::Failed { reason }) => {
            println!("backup failed: {}", reason.as_deref().unwrap_or("no reason given"));
            1
        }
        Ok(TaskOutcome::TimedOut { elapsed, polls }) => {
            println!("backup still running after {elapsed:?} ({polls} polls)");
            3
        }
        Err(e) => {
            eprintln!("backup error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> desklink::Result<TaskOutcome> {
    let mut session = Session::builder()
        .poll_policy(
            PollPolicy::new(Duration::from_secs(1), Duration::from_secs(120))
                .with_initial_delay(Duration::from_secs(1)),
        )
        .discover_with_retry(Duration::from_secs(10))
        .await?;

    let task = session.start_task(Endpoint::BACKUP, &()).await?;
    tracing::info!(%task, "backup started");
    let outcome = session.wait_for_task(&task).await?;

    session.close().await?;
    Ok(outcome)
}
