//! Interactive container debugger.
//!
//! Attaches an ephemeral debug container to a running target so an operator
//! can inspect it with tools the target image never shipped. The debug
//! process shares the target's PID namespace and sees the target's root
//! through a layered filesystem with the pulled toolset stacked on top.
//!
//! ## Usage
//!
//! ```text
//! magikdbg [options] <target-id> [command...]
//! ```
//!
//! The process exit code is the debug process's own exit code, so shell
//! scripts can chain on the result of a `--no-tty` one-shot command.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use magikdbg::{EXIT_FAILURE_CODE, NativeRuntime, Session, SessionConfig};

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        println!("magikdbg {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match SessionConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("run 'magikdbg --help' for usage");
            return ExitCode::from(EXIT_FAILURE_CODE as u8);
        }
    };

    init_logging();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        target = %config.target_id,
        image = %config.image,
        "starting debug session"
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let runtime = Arc::new(NativeRuntime::new(config.address.clone()));
    match Session::new(config, runtime, cancel).run().await {
        Ok(outcome) => {
            info!(
                status = ?outcome.status,
                exit_code = outcome.exit_code,
                "session finished"
            );
            exit_code(outcome.exit_code)
        }
        Err(e) => {
            error!(error = %e, "session failed");
            eprintln!("error: {}", e);
            exit_code(EXIT_FAILURE_CODE)
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Installs the global tracing subscriber.
///
/// Events go to stderr so the interactive console on stdout stays clean.
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: failed to install tracing subscriber");
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Cancels the session token on the first SIGINT or SIGTERM.
///
/// While the console is in raw mode Ctrl+C is forwarded to the debug
/// process as bytes; this listener fires for signals delivered from
/// outside the terminal. The session observes the token at its next
/// suspension point and runs a full teardown before reporting a
/// cancelled outcome.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, cancelling session"),
            _ = sigterm.recv() => info!("received SIGTERM, cancelling session"),
        }
        cancel.cancel();
    });
}

// ============================================================================
// Helpers
// ============================================================================

/// Maps a process exit code onto the range the OS can report.
fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}

fn print_help() {
    println!(
        r#"magikdbg - attach an interactive debug session to a running container

The debug process runs in an ephemeral container that shares the target's
PID namespace. Its root filesystem layers a pulled debug toolset over the
target's root, so target files appear at their usual paths next to tools
the target image never shipped. Everything the session creates is torn
down when the debug process exits.

USAGE:
    magikdbg [options] <target-id> [command...]

ARGS:
    <target-id>    ID of the running container to attach to
    [command...]   Command to run in the debug container (default: /bin/bash -l)

OPTIONS:
    -a, --address <path>   Runtime state directory (default: /run/magikdbg)
    -i, --image <ref>      Debug toolset image (default: docker.io/library/ubuntu:22.04)
        --id <id>          ID for the debug container (default: generated)
    -t, --tty              Run the command on a terminal (default)
        --no-tty           Inherit standard streams instead of allocating a terminal
        --read-only        Discard all writes to the composed root (default)
    -w, --writable         Capture writes in a per-session upper layer
    -h, --help             Show this help
    -V, --version          Show version

EXAMPLES:
    magikdbg payments-api
    magikdbg --image ghcr.io/tools/debug:latest payments-api
    magikdbg -w payments-api /bin/bash
    magikdbg --no-tty payments-api ps axf
"#
    );
}
