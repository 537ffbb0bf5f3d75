//! Looping test workload for end-to-end debugging exercises.
//!
//! Writes an incrementing counter to a state file once per second and echoes
//! it to stdout until SIGINT or SIGTERM ends the loop. Run it inside a
//! container to get a live, inspectable target for `magikdbg`:
//!
//! ```text
//! ticker /tmp/counter
//! ```

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: failed to install tracing subscriber");
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: ticker <state-file>")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        state_file = %path,
        "ticker starting"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                counter += 1;
                tokio::fs::write(&path, format!("{}\n", counter))
                    .await
                    .with_context(|| format!("write {}", path))?;
                println!("{}", counter);
            }
            _ = sigterm.recv() => {
                info!(ticks = counter, "received SIGTERM, exiting");
                break;
            }
            _ = sigint.recv() => {
                info!(ticks = counter, "received SIGINT, exiting");
                break;
            }
        }
    }
    Ok(())
}
