//! # Per-Session Workspace
//!
//! A workspace is the scratch directory tree backing one debug session:
//!
//! ```text
//! <state-root>/sessions/<container-id>/
//! ├── dbg/       (mountpoint for the debug image view)
//! ├── root/      (mountpoint for the composed overlay)
//! ├── streams/   (console socket)
//! ├── upper/     (writable sessions only: overlay upper layer)
//! └── work/      (writable sessions only: overlay work directory)
//! ```
//!
//! Workspaces are created during session setup and removed by the teardown
//! path via [`Workspace::release`]. They are NOT cleaned up on drop: a
//! workspace that still has active mounts inside must never be deleted, so
//! removal stays an explicit teardown step that runs after unmounting.

use crate::error::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Cheaply cloneable handle to a session's scratch directory tree.
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<WorkspaceInner>,
}

struct WorkspaceInner {
    base: PathBuf,
    writable: bool,
    released: AtomicBool,
}

impl Workspace {
    /// Creates the directory tree for a new session.
    ///
    /// Fails if a workspace for this ID already exists; stale state from a
    /// crashed session must be inspected, not silently reused.
    pub fn create(sessions_root: &Path, id: &str, writable: bool) -> Result<Self> {
        let base = sessions_root.join(id);

        if base.exists() {
            return Err(Error::StorageWriteFailed(format!(
                "session workspace already exists: {}",
                base.display()
            )));
        }

        let mut dirs = vec![base.join("dbg"), base.join("root"), base.join("streams")];
        if writable {
            dirs.push(base.join("upper"));
            dirs.push(base.join("work"));
        }

        for dir in &dirs {
            fs::create_dir_all(dir).map_err(|e| map_fs_error(dir, &e))?;
        }

        debug!("session workspace created: {}", base.display());
        Ok(Self {
            inner: Arc::new(WorkspaceInner {
                base,
                writable,
                released: AtomicBool::new(false),
            }),
        })
    }

    /// Mountpoint for the debug image snapshot view.
    pub fn dbg_dir(&self) -> PathBuf {
        self.inner.base.join("dbg")
    }

    /// Mountpoint for the composed overlay root.
    pub fn root_dir(&self) -> PathBuf {
        self.inner.base.join("root")
    }

    /// Directory holding the console socket.
    pub fn streams_dir(&self) -> PathBuf {
        self.inner.base.join("streams")
    }

    /// Overlay upper layer. `None` for read-only sessions.
    pub fn upper_dir(&self) -> Option<PathBuf> {
        self.inner.writable.then(|| self.inner.base.join("upper"))
    }

    /// Overlay work directory. `None` for read-only sessions.
    pub fn work_dir(&self) -> Option<PathBuf> {
        self.inner.writable.then(|| self.inner.base.join("work"))
    }

    /// Whether this workspace carries writable overlay state.
    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    /// Base path of the workspace tree.
    pub fn path(&self) -> &Path {
        &self.inner.base
    }

    /// Removes the workspace tree.
    ///
    /// Idempotent: only the first call does work. All mounts inside the
    /// tree must already be unmounted. A failed removal re-arms the flag so
    /// teardown retries are possible.
    pub fn release(&self) -> Result<()> {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.inner.base.exists()
            && let Err(e) = fs::remove_dir_all(&self.inner.base)
        {
            self.inner.released.store(false, Ordering::SeqCst);
            return Err(map_fs_error(&self.inner.base, &e));
        }

        debug!("session workspace released: {}", self.inner.base.display());
        Ok(())
    }
}

fn map_fs_error(path: &Path, e: &std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("{}: {}", path.display(), e))
        }
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
            Error::ResourceExhausted(format!("{}: {}", path.display(), e))
        }
        _ => Error::StorageWriteFailed(format!("{}: {}", path.display(), e)),
    }
}
