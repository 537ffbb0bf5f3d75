//! # Interactive Console Wiring
//!
//! Connects the caller's terminal to the debug container's PTY and keeps
//! the container's view of the terminal geometry current.
//!
//! ## Wiring
//!
//! ```text
//! caller tty (raw mode)                    debug container
//!   stdin  ──[pump thread]──> PTY master ──> PTY slave stdin
//!   stdout <──[pump thread]── PTY master <── PTY slave stdout/stderr
//!   SIGWINCH ──[listener]──> TIOCSWINSZ on the container task
//! ```
//!
//! The caller's terminal enters raw mode for the duration of the session so
//! control sequences reach the container instead of the local line
//! discipline; the saved mode is restored when the controller drops, on
//! every exit path.
//!
//! Pump threads are detached: they live until the process exits or the PTY
//! master reaches EOF. Resize propagation is best effort and never fails a
//! session, a lost resize only leaves the remote display stale until the
//! next one.

use crate::error::{Error, Result};
use crate::runtime::Task;
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use std::fs::File;
use std::io::{self, IsTerminal, Write};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, warn};

/// Terminal geometry as last observed from the caller's tty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    pub cols: u16,
    pub rows: u16,
}

/// Restores the saved terminal mode when dropped.
struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    fn enter() -> Result<Self> {
        let saved = tcgetattr(io::stdin())
            .map_err(|e| Error::ConsoleSetup(format!("tcgetattr on stdin: {}", e)))?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(io::stdin(), SetArg::TCSANOW, &raw)
            .map_err(|e| Error::ConsoleSetup(format!("tcsetattr raw mode: {}", e)))?;
        debug!("caller terminal switched to raw mode");
        Ok(Self { saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(io::stdin(), SetArg::TCSANOW, &self.saved) {
            warn!("failed to restore terminal mode: {}", e);
        }
    }
}

/// Owns the interactive side of a running session: raw mode, I/O pumps,
/// and resize propagation.
pub struct ConsoleController {
    task: Arc<dyn Task>,
    /// Wrapped in a mutex only for the `Sync` bound; never locked after
    /// construction.
    _raw_guard: Mutex<Option<RawModeGuard>>,
}

impl ConsoleController {
    /// Wires the caller's terminal to the task's console.
    ///
    /// Raw mode is entered only when a TTY was requested and stdin actually
    /// is a terminal, so piped invocations keep working. Tasks without a
    /// console (non-TTY sessions) get no pumps and no raw mode.
    pub fn attach(task: Arc<dyn Task>, tty: bool) -> Result<Self> {
        let raw_guard = if tty && io::stdin().is_terminal() {
            Some(RawModeGuard::enter()?)
        } else {
            None
        };

        if let Some(master) = task.console() {
            spawn_pumps(master)?;
        }

        Ok(Self {
            task,
            _raw_guard: Mutex::new(raw_guard),
        })
    }

    /// Pushes the current terminal geometry to the task.
    ///
    /// Called once right after attach so the container starts with the real
    /// size instead of the PTY default. Failures are logged, never fatal.
    pub async fn resize_to_current(&self) {
        let Some(size) = current_winsize() else {
            return;
        };
        if let Err(e) = self.task.resize(size.cols, size.rows).await {
            warn!("failed to propagate initial terminal size: {}", e);
        }
    }

    /// Spawns the SIGWINCH listener that forwards geometry changes to the
    /// task for the rest of the process lifetime.
    pub fn spawn_resize_listener(&self) -> Result<()> {
        let mut winch = signal(SignalKind::window_change())
            .map_err(|e| Error::ConsoleSetup(format!("SIGWINCH listener: {}", e)))?;
        let task = Arc::clone(&self.task);

        tokio::spawn(async move {
            while winch.recv().await.is_some() {
                let Some(size) = current_winsize() else {
                    continue;
                };
                debug!("terminal resized to {}x{}", size.cols, size.rows);
                if let Err(e) = task.resize(size.cols, size.rows).await {
                    warn!("failed to propagate terminal resize: {}", e);
                }
            }
        });

        Ok(())
    }
}

/// Reads the caller terminal's geometry. `None` when stdin is not a tty or
/// the terminal reports a degenerate size.
pub fn current_winsize() -> Option<WinSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ fills a plain struct through a valid pointer; the
    // fd is stdin, which outlives the call.
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };

    if rc == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some(WinSize {
            cols: ws.ws_col,
            rows: ws.ws_row,
        })
    } else {
        None
    }
}

/// Starts the two blocking I/O pump threads between the caller's stdio and
/// the PTY master.
fn spawn_pumps(master: OwnedFd) -> Result<()> {
    let reader_fd = master
        .try_clone()
        .map_err(|e| Error::ConsoleSetup(format!("duplicate console fd: {}", e)))?;

    let mut to_container = File::from(master);
    let mut from_container = File::from(reader_fd);

    thread::spawn(move || {
        // Blocks on stdin reads until process exit; the master side going
        // away surfaces as a write error and ends the pump.
        let _ = io::copy(&mut io::stdin(), &mut to_container);
    });

    thread::spawn(move || {
        let mut stdout = io::stdout();
        let _ = io::copy(&mut from_container, &mut stdout);
        let _ = stdout.flush();
    });

    Ok(())
}
