//! # Layered Root Composition
//!
//! Builds the debug container's root filesystem by stacking the debug
//! toolset snapshot and the target container's root into one merged view.
//!
//! ## Modes
//!
//! ```text
//! read-only                          writable
//! ─────────                          ────────
//! overlay at <ws>/root               overlay at <ws>/root
//!   lower: <ws>/dbg  (toolset)         lower: <target rootfs>
//!   lower: <target rootfs>             upper: <ws>/upper
//!   (no upper)                         work:  <ws>/work
//! ```
//!
//! Read-only sessions see the toolset stacked above the target's files and
//! cannot write through to either. Writable sessions capture every write in
//! the session's upper directory; the target's own storage is never touched.
//!
//! ## Teardown
//!
//! [`ComposedRoot::unmount`] reverses composition: the overlay first, then
//! the debug layer. Each unmount is attempted even if an earlier one fails
//! and the first error encountered is the one reported.

use crate::error::Result;
use crate::runtime::{Mount, RuntimeClient};
use crate::workspace::Workspace;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A mounted layered root and the state needed to take it down again.
pub struct ComposedRoot {
    root_dir: PathBuf,
    dbg_dir: PathBuf,
    /// False when the snapshot had no mounts to apply.
    dbg_mounted: bool,
}

impl ComposedRoot {
    /// Path the debug container uses as its root filesystem.
    pub fn path(&self) -> &Path {
        &self.root_dir
    }

    /// Unmounts the composed root, then the debug layer beneath it.
    ///
    /// Both unmounts are attempted regardless of individual failures; the
    /// first error is returned after everything has been tried.
    pub async fn unmount(&self, runtime: &dyn RuntimeClient) -> Result<()> {
        let mut first_err = None;

        if let Err(e) = runtime.unmount_all(&self.root_dir).await {
            warn!(
                "failed to unmount composed root {}: {}",
                self.root_dir.display(),
                e
            );
            first_err = Some(e);
        }

        if self.dbg_mounted
            && let Err(e) = runtime.unmount_all(&self.dbg_dir).await
        {
            warn!(
                "failed to unmount debug layer {}: {}",
                self.dbg_dir.display(),
                e
            );
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Mounts the debug snapshot view and composes the layered root on top.
///
/// Step order matters: the snapshot mounts land on the workspace's debug
/// mountpoint first, then the overlay is built at the root mountpoint. If
/// the overlay fails, the debug layer is unmounted before the error is
/// returned so no mount outlives the failed composition.
///
/// An empty `view_mounts` slice is not an error: the debug layer stays an
/// empty directory and read-only sessions degrade to target-root-only
/// visibility.
pub async fn compose_root(
    runtime: &dyn RuntimeClient,
    workspace: &Workspace,
    view_mounts: &[Mount],
    target_root: &Path,
) -> Result<ComposedRoot> {
    let dbg_dir = workspace.dbg_dir();
    let root_dir = workspace.root_dir();

    let dbg_mounted = if view_mounts.is_empty() {
        debug!("debug snapshot has no mounts, composing over an empty debug layer");
        false
    } else {
        runtime.mount_all(view_mounts, &dbg_dir).await?;
        true
    };

    let overlay = match (workspace.upper_dir(), workspace.work_dir()) {
        (Some(upper), Some(work)) => writable_overlay(target_root, &upper, &work),
        _ => readonly_overlay(&dbg_dir, target_root),
    };

    if let Err(e) = runtime
        .mount_all(std::slice::from_ref(&overlay), &root_dir)
        .await
    {
        // The debug layer must not outlive a failed overlay.
        if dbg_mounted
            && let Err(unmount_err) = runtime.unmount_all(&dbg_dir).await
        {
            warn!(
                "failed to unmount debug layer after overlay failure: {}",
                unmount_err
            );
        }
        return Err(e);
    }

    debug!("layered root mounted at {}", root_dir.display());
    Ok(ComposedRoot {
        root_dir,
        dbg_dir,
        dbg_mounted,
    })
}

/// Read-only composition: toolset stacked above the target root, no upper.
fn readonly_overlay(dbg_dir: &Path, target_root: &Path) -> Mount {
    Mount {
        fstype: "overlay".to_string(),
        source: "overlay".to_string(),
        options: vec![format!(
            "lowerdir={}:{}",
            dbg_dir.display(),
            target_root.display()
        )],
    }
}

/// Copy-on-write composition: target root as the sole lower layer, session
/// upper/work directories capturing every write.
fn writable_overlay(target_root: &Path, upper: &Path, work: &Path) -> Mount {
    Mount {
        fstype: "overlay".to_string(),
        source: "overlay".to_string(),
        options: vec![
            format!("lowerdir={}", target_root.display()),
            format!("upperdir={}", upper.display()),
            format!("workdir={}", work.display()),
        ],
    }
}
