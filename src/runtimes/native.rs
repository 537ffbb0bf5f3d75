//! # Native Runtime Client - libcontainer-Backed Session Operations
//!
//! Implements [`RuntimeClient`] directly against youki's `libcontainer`,
//! with no daemon in between: container state lives under the state root and
//! every operation is a library call plus filesystem work.
//!
//! ## Platform Requirements
//!
//! | Requirement          | Check                      |
//! |----------------------|----------------------------|
//! | Linux OS             | Compile target             |
//! | Namespace support    | `/proc/self/ns/pid` exists |
//! | Mount privileges     | CAP_SYS_ADMIN              |
//! | Ptrace grant         | CAP_SYS_PTRACE (granted to the debug task) |
//!
//! ## State Layout
//!
//! ```text
//! <state-root>/
//! ├── containers/   (libcontainer state, one dir per container)
//! ├── bundles/      (OCI bundles written by create_container)
//! ├── store/        (layer blobs and snapshot views)
//! └── sessions/     (per-session workspaces)
//! ```
//!
//! ## Console Handoff
//!
//! Terminal tasks use the OCI console-socket protocol: this process binds a
//! unix socket, the container init connects during setup and passes its PTY
//! master over `SCM_RIGHTS`. The accept runs on a dedicated thread because
//! the container build blocks the calling thread until init is ready, and
//! init in turn blocks until the descriptor is taken off the socket.
//!
//! ## Exit Observation
//!
//! `libcontainer` detaches the container init from its creator, so exit
//! codes are observable only if this process becomes a child subreaper
//! before the init is forked ([`RuntimeClient::connect`] does this). A
//! dedicated watcher thread then blocks in `waitpid` on the init PID and
//! reports the exit code over a oneshot channel exactly once.

use crate::constants::{
    BUNDLE_DIR, CONSOLE_READY_TIMEOUT, CONTAINER_STATE_DIR, EXIT_FAILURE_CODE, SESSION_DIR,
    STORE_DIR, validate_container_id,
};
use crate::error::{Error, Result};
use crate::registry::{self, ImageHandle};
use crate::runtime::{Mount, RuntimeClient, StreamConfig, TargetHandle, TargetTask, Task};
use crate::spec::OciSpec;
use crate::store::LayerStore;
use async_trait::async_trait;
use libcontainer::container::builder::ContainerBuilder;
use libcontainer::container::{Container, ContainerStatus};
use libcontainer::signal::Signal as LibcontainerSignal;
use libcontainer::syscall::syscall::SyscallType;
use nix::cmsg_space;
use nix::mount::{MntFlags, MsFlags, umount2};
use nix::sys::prctl;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use std::fs;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// [`RuntimeClient`] backed by libcontainer and direct mount syscalls.
///
/// ## Thread Safety
///
/// The runtime itself is stateless apart from paths; all mutable container
/// state lives on disk in libcontainer's format, so a target created by any
/// compatible runtime under the same state root is visible here.
pub struct NativeRuntime {
    state_root: PathBuf,
    store: LayerStore,
}

impl NativeRuntime {
    /// Creates a runtime client rooted at `state_root`. No I/O happens
    /// until [`RuntimeClient::connect`].
    pub fn new(state_root: PathBuf) -> Self {
        let store = LayerStore::new(state_root.join(STORE_DIR));
        Self { state_root, store }
    }

    fn containers_dir(&self) -> PathBuf {
        self.state_root.join(CONTAINER_STATE_DIR)
    }

    fn bundles_dir(&self) -> PathBuf {
        self.state_root.join(BUNDLE_DIR)
    }

    fn load(&self, id: &str) -> Result<Container> {
        let container_dir = self.containers_dir().join(id);
        if !container_dir.exists() {
            return Err(Error::ContainerNotFound(id.to_string()));
        }

        Container::load(container_dir)
            .map_err(|e| Error::ContainerNotFound(format!("{} (state unreadable: {})", id, e)))
    }
}

/// Reads and parses the OCI spec from a bundle directory.
fn read_bundle_spec(bundle: &Path) -> Result<OciSpec> {
    let config_path = bundle.join("config.json");
    let data = fs::read_to_string(&config_path).map_err(|e| {
        Error::InvalidSpec(format!("cannot read {}: {}", config_path.display(), e))
    })?;
    serde_json::from_str(&data)
        .map_err(|e| Error::Serialization(format!("{}: {}", config_path.display(), e)))
}

/// Resolves a bundle's root filesystem path to an absolute host path.
fn resolve_root(bundle: &Path, spec: &OciSpec) -> PathBuf {
    let root = spec
        .root
        .as_ref()
        .map(|r| PathBuf::from(&r.path))
        .unwrap_or_else(|| PathBuf::from("rootfs"));

    if root.is_absolute() {
        root
    } else {
        bundle.join(root)
    }
}

#[async_trait]
impl RuntimeClient for NativeRuntime {
    async fn connect(&self) -> Result<()> {
        if !Path::new("/proc/self/ns/pid").exists() {
            return Err(Error::Connection {
                address: self.state_root.clone(),
                reason: "Linux namespaces not available".to_string(),
            });
        }

        for dir in [
            self.containers_dir(),
            self.bundles_dir(),
            self.state_root.join(SESSION_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::Connection {
                address: self.state_root.clone(),
                reason: format!("cannot create {}: {}", dir.display(), e),
            })?;
        }

        self.store.init().map_err(|e| Error::Connection {
            address: self.state_root.clone(),
            reason: e.to_string(),
        })?;

        // The container init detaches from its creator; without subreaper
        // status it would reparent to PID 1 and its exit code would be
        // unobservable from here.
        prctl::set_child_subreaper(true).map_err(|e| Error::Connection {
            address: self.state_root.clone(),
            reason: format!("prctl(PR_SET_CHILD_SUBREAPER): {}", e),
        })?;

        info!("runtime state root ready at {}", self.state_root.display());
        Ok(())
    }

    async fn load_container(&self, id: &str) -> Result<TargetHandle> {
        let container = self.load(id)?;
        let bundle = container.state.bundle.clone();
        let spec = read_bundle_spec(&bundle)?;
        let root = resolve_root(&bundle, &spec);

        debug!("loaded container {} (bundle {})", id, bundle.display());
        Ok(TargetHandle {
            id: id.to_string(),
            bundle,
            root,
        })
    }

    async fn container_spec(&self, handle: &TargetHandle) -> Result<OciSpec> {
        read_bundle_spec(&handle.bundle)
    }

    async fn container_task(&self, handle: &TargetHandle) -> Result<TargetTask> {
        let container = self.load(&handle.id)?;

        if container.state.status != ContainerStatus::Running {
            return Err(Error::NoTask(handle.id.clone()));
        }

        let pid = container
            .pid()
            .ok_or_else(|| Error::NoTask(handle.id.clone()))?;

        Ok(TargetTask {
            pid: pid.as_raw() as u32,
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<ImageHandle> {
        registry::pull_image(reference, &self.store).await
    }

    async fn snapshot_view(&self, key: &str, image: &ImageHandle) -> Result<Vec<Mount>> {
        let fs_dir = self.store.create_view(key, &image.layers)?;

        // The view is served as a read-only recursive bind, the same
        // descriptor shape a snapshotter would hand back.
        Ok(vec![Mount {
            fstype: "bind".to_string(),
            source: fs_dir.to_string_lossy().to_string(),
            options: vec!["rbind".to_string(), "ro".to_string()],
        }])
    }

    async fn snapshot_remove(&self, key: &str) -> Result<()> {
        self.store.remove_view(key)
    }

    async fn mount_all(&self, mounts: &[Mount], target: &Path) -> Result<()> {
        for mount in mounts {
            mount_one(mount, target)?;
        }
        Ok(())
    }

    async fn unmount_all(&self, target: &Path) -> Result<()> {
        umount2(target, MntFlags::empty()).map_err(|e| Error::MountFailed {
            target: target.to_path_buf(),
            reason: format!("umount: {}", e),
        })?;
        debug!("unmounted {}", target.display());
        Ok(())
    }

    async fn create_container(&self, id: &str, spec: &OciSpec) -> Result<()> {
        validate_container_id(id).map_err(|reason| Error::CreateFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;

        let bundle = self.bundles_dir().join(id);
        if bundle.exists() {
            return Err(Error::CreateFailed {
                id: id.to_string(),
                reason: "a container with this ID already exists".to_string(),
            });
        }

        fs::create_dir_all(&bundle).map_err(|e| Error::CreateFailed {
            id: id.to_string(),
            reason: format!("bundle directory: {}", e),
        })?;

        let json = serde_json::to_string_pretty(spec)
            .map_err(|e| Error::Serialization(format!("debug spec: {}", e)))?;
        fs::write(bundle.join("config.json"), json).map_err(|e| Error::CreateFailed {
            id: id.to_string(),
            reason: format!("bundle config: {}", e),
        })?;

        info!("created container {} (bundle {})", id, bundle.display());
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut first_err = None;

        let container_dir = self.containers_dir().join(id);
        if container_dir.exists() {
            match Container::load(container_dir) {
                Ok(mut container) => {
                    if let Err(e) = container.delete(true) {
                        first_err = Some(Error::DeleteFailed {
                            id: id.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
                Err(e) => {
                    first_err = Some(Error::DeleteFailed {
                        id: id.to_string(),
                        reason: format!("load state: {}", e),
                    });
                }
            }
        }

        let bundle = self.bundles_dir().join(id);
        if bundle.exists()
            && let Err(e) = fs::remove_dir_all(&bundle)
        {
            let removal = Error::DeleteFailed {
                id: id.to_string(),
                reason: format!("bundle removal: {}", e),
            };
            if first_err.is_none() {
                first_err = Some(removal);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!("deleted container {}", id);
                Ok(())
            }
        }
    }

    async fn new_task(&self, id: &str, streams: StreamConfig) -> Result<Arc<dyn Task>> {
        let bundle = self.bundles_dir().join(id);
        if !bundle.join("config.json").exists() {
            return Err(Error::TaskFailed {
                id: id.to_string(),
                reason: "bundle config.json not found".to_string(),
            });
        }

        // The receiver thread must exist before the build: init blocks
        // inside its setup until the console descriptor is accepted.
        let console_rx = match &streams.console_socket {
            Some(path) => Some(spawn_console_receiver(path)?),
            None => None,
        };

        let build_result = ContainerBuilder::new(id.to_string(), SyscallType::default())
            .with_root_path(self.containers_dir())
            .map_err(|e| Error::TaskFailed {
                id: id.to_string(),
                reason: format!("state root: {}", e),
            })?
            .with_console_socket(streams.console_socket.as_ref())
            .validate_id()
            .map_err(|e| Error::TaskFailed {
                id: id.to_string(),
                reason: format!("container id: {}", e),
            })?
            .as_init(&bundle)
            .with_systemd(false)
            .with_detach(true)
            .build();

        let container = match build_result {
            Ok(container) => container,
            Err(e) => {
                // Unblock the parked accept thread so it can exit.
                if let Some(path) = &streams.console_socket {
                    let _ = UnixStream::connect(path);
                }
                return Err(Error::TaskFailed {
                    id: id.to_string(),
                    reason: format!("container build: {}", e),
                });
            }
        };

        let console = match console_rx {
            Some(rx) => match rx.recv_timeout(CONSOLE_READY_TIMEOUT) {
                Ok(fd) => Some(fd),
                Err(_) => {
                    return Err(Error::ConsoleSetup(
                        "console descriptor not received from container init".to_string(),
                    ));
                }
            },
            None => None,
        };

        let pid = container
            .pid()
            .ok_or_else(|| Error::TaskFailed {
                id: id.to_string(),
                reason: "created container reports no pid".to_string(),
            })?
            .as_raw();

        let (exit_tx, exit_rx) = oneshot::channel();
        let watcher = spawn_exit_watcher(pid, exit_tx);

        info!("task created for container {} (pid {})", id, pid);
        Ok(Arc::new(NativeTask {
            id: id.to_string(),
            pid,
            container: Mutex::new(container),
            console,
            exit: Mutex::new(Some(exit_rx)),
            watcher: Mutex::new(Some(watcher)),
        }))
    }
}

// =============================================================================
// Task
// =============================================================================

/// A debug task bound to one libcontainer container.
struct NativeTask {
    id: String,
    pid: i32,
    container: Mutex<Container>,
    /// PTY master received over the console socket, when a terminal was
    /// requested.
    console: Option<OwnedFd>,
    /// Exit channel, handed out once by [`Task::wait`].
    exit: Mutex<Option<oneshot::Receiver<i32>>>,
    watcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NativeTask {
    fn lock_container(&self) -> Result<std::sync::MutexGuard<'_, Container>> {
        self.container.lock().map_err(|e| Error::TaskFailed {
            id: self.id.clone(),
            reason: format!("lock poisoned: {}", e),
        })
    }
}

#[async_trait]
impl Task for NativeTask {
    fn pid(&self) -> u32 {
        self.pid as u32
    }

    fn console(&self) -> Option<OwnedFd> {
        self.console.as_ref().and_then(|fd| fd.try_clone().ok())
    }

    async fn start(&self) -> Result<()> {
        let mut container = self.lock_container()?;
        container.start().map_err(|e| Error::TaskFailed {
            id: self.id.clone(),
            reason: format!("start: {}", e),
        })?;
        debug!("started task for container {}", self.id);
        Ok(())
    }

    async fn wait(&self) -> Result<oneshot::Receiver<i32>> {
        self.exit
            .lock()
            .map_err(|e| Error::TaskFailed {
                id: self.id.clone(),
                reason: format!("lock poisoned: {}", e),
            })?
            .take()
            .ok_or_else(|| Error::TaskFailed {
                id: self.id.clone(),
                reason: "exit status already claimed".to_string(),
            })
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let Some(console) = &self.console else {
            return Err(Error::TaskFailed {
                id: self.id.clone(),
                reason: "task has no console".to_string(),
            });
        };

        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCSWINSZ reads a plain struct through a valid pointer;
        // the fd is the PTY master this task owns.
        let rc = unsafe { libc::ioctl(console.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(Error::TaskFailed {
                id: self.id.clone(),
                reason: format!("TIOCSWINSZ: {}", std::io::Error::last_os_error()),
            });
        }

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        // Kill first. A task that already exited makes this a no-op; the
        // error is informational only.
        {
            let mut container = self.lock_container()?;
            let sigkill =
                LibcontainerSignal::try_from("SIGKILL").map_err(|e| Error::TaskFailed {
                    id: self.id.clone(),
                    reason: format!("signal: {}", e),
                })?;
            if let Err(e) = container.kill(sigkill, true) {
                debug!("kill for task {}: {} (already exited?)", self.id, e);
            }
        }

        // Joining the watcher guarantees the exit channel has fired before
        // this returns, so a caller holding the receiver sees the real
        // code even on the cancellation path.
        let watcher = self
            .watcher
            .lock()
            .map_err(|e| Error::TaskFailed {
                id: self.id.clone(),
                reason: format!("lock poisoned: {}", e),
            })?
            .take();
        if let Some(handle) = watcher
            && handle.join().is_err()
        {
            warn!("exit watcher for task {} panicked", self.id);
        }

        debug!("deleted task for container {}", self.id);
        Ok(())
    }
}

/// Blocks in `waitpid` on the container init and reports its exit code.
fn spawn_exit_watcher(pid: i32, exit_tx: oneshot::Sender<i32>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut status: libc::c_int = 0;

        // SAFETY: pid is the container init forked on our behalf; as its
        // subreaper we may wait on it, and status is a valid out pointer.
        let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };

        let code = if rc < 0 {
            warn!("waitpid({}) failed: {}", pid, std::io::Error::last_os_error());
            EXIT_FAILURE_CODE
        } else if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            EXIT_FAILURE_CODE
        };

        debug!("task pid {} exited with code {}", pid, code);
        let _ = exit_tx.send(code);
    })
}

// =============================================================================
// Console socket
// =============================================================================

/// Binds the console socket and accepts the PTY handoff on its own thread.
fn spawn_console_receiver(path: &Path) -> Result<mpsc::Receiver<OwnedFd>> {
    if path.exists() {
        let _ = fs::remove_file(path);
    }

    let listener = UnixListener::bind(path).map_err(|e| {
        Error::ConsoleSetup(format!("bind console socket {}: {}", path.display(), e))
    })?;
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            match recv_console_fd(&stream) {
                Ok(fd) => {
                    let _ = tx.send(fd);
                }
                Err(e) => warn!("console descriptor handoff failed: {}", e),
            }
        }
    });

    Ok(rx)
}

/// Receives one file descriptor over `SCM_RIGHTS`.
fn recv_console_fd(stream: &UnixStream) -> Result<OwnedFd> {
    let mut buf = [0u8; 4096];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(|e| Error::ConsoleSetup(format!("recvmsg: {}", e)))?;

    for cmsg in msg
        .cmsgs()
        .map_err(|e| Error::ConsoleSetup(format!("control messages: {}", e)))?
    {
        if let ControlMessageOwned::ScmRights(fds) = cmsg
            && let Some(&fd) = fds.first()
        {
            // SAFETY: the descriptor was just passed to us over SCM_RIGHTS
            // and nothing else owns it in this process.
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }

    Err(Error::ConsoleSetup(
        "console message carried no file descriptor".to_string(),
    ))
}

// =============================================================================
// Mounts
// =============================================================================

/// Applies one mount descriptor at `target`.
fn mount_one(mount: &Mount, target: &Path) -> Result<()> {
    let (flags, data) = mount_flags(&mount.options);

    let source = (!mount.source.is_empty()).then_some(mount.source.as_str());
    let fstype = (!mount.fstype.is_empty()).then_some(mount.fstype.as_str());
    let data_opt = (!data.is_empty()).then_some(data.as_str());

    nix::mount::mount(source, target, fstype, flags, data_opt).map_err(|e| {
        Error::MountFailed {
            target: target.to_path_buf(),
            reason: format!("{} from {}: {}", mount.fstype, mount.source, e),
        }
    })?;

    // The kernel ignores MS_RDONLY on the initial bind; it takes effect
    // only through a remount.
    if flags.contains(MsFlags::MS_BIND) && mount.options.iter().any(|o| o == "ro") {
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::MountFailed {
            target: target.to_path_buf(),
            reason: format!("read-only remount: {}", e),
        })?;
    }

    debug!("mounted {} at {}", mount.fstype, target.display());
    Ok(())
}

/// Splits mount options into mount(2) flags and the data string.
fn mount_flags(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for opt in options {
        match opt.as_str() {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => data.push(other.to_string()),
        }
    }

    (flags, data.join(","))
}
