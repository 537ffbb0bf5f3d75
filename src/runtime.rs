//! Runtime client interface - the boundary to the container control plane.
//!
//! The session orchestrator never talks to a concrete runtime directly. It
//! drives a [`RuntimeClient`], which bundles everything the session needs
//! from the control plane: target lookup, image pulls, snapshot views, host
//! mounts, and container/task lifecycle. The in-tree Linux binding is
//! [`NativeRuntime`]; tests script a fake against the same trait.
//!
//! # Contract
//!
//! Implementations **MUST** ensure:
//!
//! 1. Every method is a suspension point - callers may race it against
//!    cancellation and drop the future.
//! 2. `snapshot_view` registers state that `snapshot_remove` fully undoes.
//! 3. `new_task` returns a task whose exit channel fires exactly once, even
//!    when the task is killed by [`Task::delete`].
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync`; the orchestrator shares them
//! across the resize listener and the main sequence via `Arc`.
//!
//! [`NativeRuntime`]: crate::runtimes::NativeRuntime

use crate::error::Result;
use crate::registry::ImageHandle;
use crate::spec::OciSpec;
use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;

// =============================================================================
// Handles
// =============================================================================

/// Resolved handle to the target container.
///
/// Captured once at session start and read-only afterwards. `root` is the
/// absolute host path of the target's root filesystem, resolved against the
/// target's bundle directory.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    /// Container ID in the runtime namespace.
    pub id: String,
    /// The target's bundle directory.
    pub bundle: PathBuf,
    /// Absolute host path of the target root filesystem.
    pub root: PathBuf,
}

/// The target's primary task.
#[derive(Debug, Clone, Copy)]
pub struct TargetTask {
    /// Host PID of the target's init process. Anchors the shared PID
    /// namespace via `/proc/<pid>/ns/pid`.
    pub pid: u32,
}

/// A filesystem mount descriptor.
///
/// `source`, `fstype`, and `options` mirror the mount(2) arguments; the
/// mount point is supplied separately to [`RuntimeClient::mount_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Filesystem type (`overlay`, `bind`, ...).
    pub fstype: String,
    /// Mount source (a directory for binds, a pseudo-source like `overlay`
    /// otherwise).
    pub source: String,
    /// Mount options; flag-like entries (`bind`, `ro`) plus data options
    /// (`lowerdir=...`).
    pub options: Vec<String>,
}

/// Stream wiring requested for a new task.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    /// Allocate a terminal for the task. Without one the task inherits the
    /// caller's stdio.
    pub tty: bool,
    /// Where the runtime should hand back the console descriptor when
    /// `tty` is set. `None` lets the implementation pick a location.
    pub console_socket: Option<PathBuf>,
}

// =============================================================================
// Task
// =============================================================================

/// A created task inside a debug container.
///
/// The lifecycle mirrors the runtime's: created (not running) after
/// [`RuntimeClient::new_task`], running after [`Task::start`], gone after
/// [`Task::delete`]. Callers subscribe to the exit channel via
/// [`Task::wait`] **before** starting, so no exit can be missed.
#[async_trait]
pub trait Task: Send + Sync {
    /// Host PID of the task's init process.
    fn pid(&self) -> u32;

    /// Duplicate of the task's console descriptor, when one was allocated.
    fn console(&self) -> Option<OwnedFd>;

    /// Starts the created task.
    async fn start(&self) -> Result<()>;

    /// Claims the exit channel. Fires with the process exit code (or
    /// `128 + signal` for signal deaths). May only be claimed once.
    async fn wait(&self) -> Result<oneshot::Receiver<i32>>;

    /// Resizes the task's terminal.
    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Deletes the task, killing the process if it is still running. The
    /// exit channel fires before this returns.
    async fn delete(&self) -> Result<()>;
}

// =============================================================================
// Runtime Client
// =============================================================================

/// Everything the session orchestrator needs from the container runtime.
///
/// Methods are grouped by the session phase that uses them; the
/// orchestrator calls them strictly in acquisition order and undoes them
/// strictly in reverse.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Establishes (or validates) the control plane connection.
    async fn connect(&self) -> Result<()>;

    /// Looks up a container in the runtime namespace.
    async fn load_container(&self, id: &str) -> Result<TargetHandle>;

    /// Parses the container's runtime spec.
    async fn container_spec(&self, handle: &TargetHandle) -> Result<OciSpec>;

    /// Resolves the container's primary task.
    async fn container_task(&self, handle: &TargetHandle) -> Result<TargetTask>;

    /// Pulls an image and caches its layers.
    async fn pull_image(&self, reference: &str) -> Result<ImageHandle>;

    /// Materializes a read-only view of the image's layer chain, keyed by
    /// `key`, and returns the mounts that expose it.
    async fn snapshot_view(&self, key: &str, image: &ImageHandle) -> Result<Vec<Mount>>;

    /// Removes a snapshot view and its registration.
    async fn snapshot_remove(&self, key: &str) -> Result<()>;

    /// Applies mounts at a mount point, in order.
    async fn mount_all(&self, mounts: &[Mount], target: &Path) -> Result<()>;

    /// Unmounts a mount point.
    async fn unmount_all(&self, target: &Path) -> Result<()>;

    /// Registers a debug container from a composed spec.
    async fn create_container(&self, id: &str, spec: &OciSpec) -> Result<()>;

    /// Deletes a debug container's registration and remaining state.
    async fn delete_container(&self, id: &str) -> Result<()>;

    /// Creates the container's task with the requested stream wiring.
    async fn new_task(&self, id: &str, streams: StreamConfig) -> Result<Arc<dyn Task>>;
}
