//! End-to-end orchestration tests against an in-memory runtime.
//!
//! A scriptable fake runtime records every call in one shared log and can
//! fail at any step, which pins down the acquisition order, the reverse
//! teardown order, and the disposition rules for completion, failure, and
//! cancellation without touching real mounts or containers. Only the
//! session workspace is real: it lands in a per-test temp directory.

use async_trait::async_trait;
use magikdbg::config::SessionConfig;
use magikdbg::spec::OciSpec;
use magikdbg::{
    Error, ImageHandle, Mount, Result, RuntimeClient, Session, SessionStatus, StreamConfig,
    TargetHandle, TargetTask, Task,
};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fake Runtime
// =============================================================================

const TARGET_ROOT: &str = "/fake/target/rootfs";
const TARGET_PID: u32 = 31337;
const KILL_EXIT_CODE: i32 = 137;

/// What the fake should do, beyond answering every call successfully.
#[derive(Default)]
struct Script {
    /// Operation that fails with a scripted error. Mount operations carry
    /// their mountpoint label ("mount_all dbg", "unmount_all root").
    fail_at: Option<&'static str>,
    /// Second failing operation, for acquisition-plus-teardown scenarios.
    fail_also: Option<&'static str>,
    /// Exit code the task reports as soon as it is started.
    exit_on_start: Option<i32>,
    /// Snapshot view resolves to no mounts at all.
    empty_snapshot: bool,
}

struct FakeTask {
    log: Arc<Mutex<Vec<String>>>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
    started: Notify,
    exit_on_start: Option<i32>,
}

#[async_trait]
impl Task for FakeTask {
    fn pid(&self) -> u32 {
        TARGET_PID + 1
    }

    fn console(&self) -> Option<OwnedFd> {
        None
    }

    async fn start(&self) -> Result<()> {
        self.log.lock().unwrap().push("task.start".to_string());
        if let Some(code) = self.exit_on_start
            && let Some(tx) = self.exit_tx.lock().unwrap().take()
        {
            let _ = tx.send(code);
        }
        self.started.notify_one();
        Ok(())
    }

    async fn wait(&self) -> Result<oneshot::Receiver<i32>> {
        self.log.lock().unwrap().push("task.wait".to_string());
        let (tx, rx) = oneshot::channel();
        *self.exit_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.log.lock().unwrap().push("task.delete".to_string());
        // Deleting a live task kills it; the exit watcher reports the
        // signal-death code.
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(KILL_EXIT_CODE);
        }
        Ok(())
    }
}

struct FakeRuntime {
    log: Arc<Mutex<Vec<String>>>,
    script: Script,
    task: Arc<FakeTask>,
    last_overlay: Mutex<Option<Vec<Mount>>>,
    last_spec: Mutex<Option<OciSpec>>,
    last_streams: Mutex<Option<(bool, Option<PathBuf>)>>,
}

impl FakeRuntime {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn fails(&self, op: &str) -> bool {
        self.script.fail_at == Some(op) || self.script.fail_also == Some(op)
    }
}

/// Mountpoint label used in the call log: the workspace subdirectory the
/// mount lands in ("dbg" or "root").
fn dir_label(target: &Path) -> String {
    target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| target.display().to_string())
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn connect(&self) -> Result<()> {
        self.record("connect".to_string());
        if self.fails("connect") {
            return Err(Error::Connection {
                address: PathBuf::from("/fake"),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn load_container(&self, id: &str) -> Result<TargetHandle> {
        self.record(format!("load_container {}", id));
        if self.fails("load_container") {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        Ok(TargetHandle {
            id: id.to_string(),
            bundle: PathBuf::from("/fake/bundles/target"),
            root: PathBuf::from(TARGET_ROOT),
        })
    }

    async fn container_spec(&self, _handle: &TargetHandle) -> Result<OciSpec> {
        self.record("container_spec".to_string());
        let spec = serde_json::from_str(
            r#"{
                "process": { "args": ["/app/server"], "env": ["APP_MODE=production"] },
                "mounts": [
                    { "destination": "/data", "type": "bind", "source": "/srv/data",
                      "options": ["rbind", "rw"] }
                ]
            }"#,
        )
        .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(spec)
    }

    async fn container_task(&self, handle: &TargetHandle) -> Result<TargetTask> {
        self.record("container_task".to_string());
        if self.fails("container_task") {
            return Err(Error::NoTask(handle.id.clone()));
        }
        Ok(TargetTask { pid: TARGET_PID })
    }

    async fn pull_image(&self, reference: &str) -> Result<ImageHandle> {
        self.record("pull_image".to_string());
        if self.fails("pull_image") {
            return Err(Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(ImageHandle {
            reference: reference.to_string(),
            digest: "sha256:feed".to_string(),
            layers: Vec::new(),
        })
    }

    async fn snapshot_view(&self, key: &str, _image: &ImageHandle) -> Result<Vec<Mount>> {
        self.record(format!("snapshot_view {}", key));
        if self.fails("snapshot_view") {
            return Err(Error::SnapshotFailed {
                key: key.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        if self.script.empty_snapshot {
            return Ok(Vec::new());
        }
        Ok(vec![Mount {
            fstype: "bind".to_string(),
            source: "/fake/store/views/dbg-1/fs".to_string(),
            options: vec!["rbind".to_string(), "ro".to_string()],
        }])
    }

    async fn snapshot_remove(&self, key: &str) -> Result<()> {
        self.record(format!("snapshot_remove {}", key));
        if self.fails("snapshot_remove") {
            return Err(Error::SnapshotFailed {
                key: key.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn mount_all(&self, mounts: &[Mount], target: &Path) -> Result<()> {
        let label = format!("mount_all {}", dir_label(target));
        self.record(label.clone());
        if self.fails(&label) {
            return Err(Error::MountFailed {
                target: target.to_path_buf(),
                reason: "scripted failure".to_string(),
            });
        }
        if dir_label(target) == "root" {
            *self.last_overlay.lock().unwrap() = Some(mounts.to_vec());
        }
        Ok(())
    }

    async fn unmount_all(&self, target: &Path) -> Result<()> {
        let label = format!("unmount_all {}", dir_label(target));
        self.record(label.clone());
        if self.fails(&label) {
            return Err(Error::MountFailed {
                target: target.to_path_buf(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(&self, id: &str, spec: &OciSpec) -> Result<()> {
        self.record(format!("create_container {}", id));
        if self.fails("create_container") {
            return Err(Error::CreateFailed {
                id: id.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        self.record(format!("delete_container {}", id));
        if self.fails("delete_container") {
            return Err(Error::DeleteFailed {
                id: id.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn new_task(&self, id: &str, streams: StreamConfig) -> Result<Arc<dyn Task>> {
        self.record(format!("new_task {}", id));
        if self.fails("new_task") {
            return Err(Error::TaskFailed {
                id: id.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        *self.last_streams.lock().unwrap() = Some((streams.tty, streams.console_socket));
        Ok(self.task.clone())
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    runtime: Arc<FakeRuntime>,
    task: Arc<FakeTask>,
    log: Arc<Mutex<Vec<String>>>,
    state_dir: TempDir,
}

impl Fixture {
    fn new(script: Script) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Arc::new(FakeTask {
            log: log.clone(),
            exit_tx: Mutex::new(None),
            started: Notify::new(),
            exit_on_start: script.exit_on_start,
        });
        let runtime = Arc::new(FakeRuntime {
            log: log.clone(),
            script,
            task: task.clone(),
            last_overlay: Mutex::new(None),
            last_spec: Mutex::new(None),
            last_streams: Mutex::new(None),
        });
        Fixture {
            runtime,
            task,
            log,
            state_dir: TempDir::new().unwrap(),
        }
    }

    fn config(&self, read_only: bool) -> SessionConfig {
        SessionConfig {
            address: self.state_dir.path().to_path_buf(),
            target_id: "my-app".to_string(),
            image: "docker.io/library/ubuntu:22.04".to_string(),
            container_id: "dbg-1".to_string(),
            command: vec!["/bin/bash".to_string(), "-l".to_string()],
            tty: false,
            read_only,
        }
    }

    fn session(&self, read_only: bool, cancel: CancellationToken) -> Session {
        Session::new(self.config(read_only), self.runtime.clone(), cancel)
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn workspace_dir(&self) -> PathBuf {
        self.state_dir.path().join("sessions").join("dbg-1")
    }
}

// =============================================================================
// Completion Tests
// =============================================================================

#[tokio::test]
async fn test_completed_session_runs_full_sequence() {
    let fx = Fixture::new(Script {
        exit_on_start: Some(0),
        ..Script::default()
    });

    let outcome = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.exit_code, 0);

    let calls = fx.calls();
    let calls: Vec<&str> = calls.iter().map(String::as_str).collect();
    assert_eq!(
        calls,
        [
            "connect",
            "load_container my-app",
            "container_spec",
            "container_task",
            "pull_image",
            "snapshot_view dbg-1",
            "mount_all dbg",
            "mount_all root",
            "create_container dbg-1",
            "new_task dbg-1",
            "task.wait",
            "task.start",
            // Teardown, reverse of acquisition.
            "task.delete",
            "delete_container dbg-1",
            "unmount_all root",
            "unmount_all dbg",
            "snapshot_remove dbg-1",
        ]
    );

    assert!(
        !fx.workspace_dir().exists(),
        "workspace should be released during teardown"
    );
}

#[tokio::test]
async fn test_exit_code_propagates() {
    let fx = Fixture::new(Script {
        exit_on_start: Some(3),
        ..Script::default()
    });

    let outcome = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.exit_code, 3);
}

#[tokio::test]
async fn test_readonly_overlay_composition() {
    let fx = Fixture::new(Script {
        exit_on_start: Some(0),
        ..Script::default()
    });

    fx.session(true, CancellationToken::new())
        .run()
        .await
        .unwrap();

    let overlay = fx.runtime.last_overlay.lock().unwrap().clone().unwrap();
    assert_eq!(overlay.len(), 1);
    assert_eq!(overlay[0].fstype, "overlay");

    let ws = fx.workspace_dir();
    let expected_lower = format!("lowerdir={}:{}", ws.join("dbg").display(), TARGET_ROOT);
    assert_eq!(overlay[0].options, vec![expected_lower]);
}

#[tokio::test]
async fn test_writable_overlay_composition() {
    let fx = Fixture::new(Script {
        exit_on_start: Some(0),
        ..Script::default()
    });

    fx.session(false, CancellationToken::new())
        .run()
        .await
        .unwrap();

    let overlay = fx.runtime.last_overlay.lock().unwrap().clone().unwrap();
    let ws = fx.workspace_dir();
    assert_eq!(
        overlay[0].options,
        vec![
            // The toolset layer never joins a writable overlay; the target
            // root is the sole lower layer.
            format!("lowerdir={}", TARGET_ROOT),
            format!("upperdir={}", ws.join("upper").display()),
            format!("workdir={}", ws.join("work").display()),
        ]
    );
}

#[tokio::test]
async fn test_composed_spec_wiring() {
    let fx = Fixture::new(Script {
        exit_on_start: Some(0),
        ..Script::default()
    });

    fx.session(true, CancellationToken::new())
        .run()
        .await
        .unwrap();

    let spec = fx.runtime.last_spec.lock().unwrap().clone().unwrap();

    // Root is the composed overlay mountpoint inside the workspace.
    let root = spec.root.unwrap();
    assert_eq!(
        root.path,
        fx.workspace_dir().join("root").display().to_string()
    );

    // PID namespace comes from the resolved target task.
    let namespaces = spec.linux.unwrap().namespaces;
    let pid_ns = namespaces.iter().find(|ns| ns.ns_type == "pid").unwrap();
    assert_eq!(
        pid_ns.path.as_deref(),
        Some(format!("/proc/{}/ns/pid", TARGET_PID).as_str())
    );

    // Target context carried into the debug process.
    let process = spec.process.unwrap();
    assert!(process.env.contains(&"APP_MODE=production".to_string()));
    assert!(spec.mounts.iter().any(|m| m.destination == "/data"));

    // Streams follow the session configuration: no TTY, no console socket.
    let (tty, console_socket) = fx.runtime.last_streams.lock().unwrap().clone().unwrap();
    assert!(!tty);
    assert!(console_socket.is_none());
}

#[tokio::test]
async fn test_empty_snapshot_composes_target_only() {
    let fx = Fixture::new(Script {
        exit_on_start: Some(0),
        empty_snapshot: true,
        ..Script::default()
    });

    let outcome = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);

    let calls = fx.calls();
    assert!(
        !calls.iter().any(|c| c == "mount_all dbg"),
        "no debug layer mount for an empty snapshot"
    );
    assert!(calls.iter().any(|c| c == "mount_all root"));
    assert!(
        !calls.iter().any(|c| c == "unmount_all dbg"),
        "nothing to unmount on the debug side"
    );
    assert!(calls.iter().any(|c| c == "unmount_all root"));
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test]
async fn test_connect_failure_acquires_nothing() {
    let fx = Fixture::new(Script {
        fail_at: Some("connect"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Connection { .. }));
    assert_eq!(fx.calls(), ["connect"]);
    assert!(!fx.workspace_dir().exists());
}

#[tokio::test]
async fn test_pull_failure_has_nothing_to_unwind() {
    let fx = Fixture::new(Script {
        fail_at: Some("pull_image"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ImagePullFailed { .. }));
    let calls = fx.calls();
    assert_eq!(calls.last().unwrap(), "pull_image");
    assert!(!calls.iter().any(|c| c.starts_with("snapshot_remove")));
}

#[tokio::test]
async fn test_snapshot_failure_has_nothing_to_unwind() {
    let fx = Fixture::new(Script {
        fail_at: Some("snapshot_view"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SnapshotFailed { .. }));
    // The view never registered, so teardown must not try to remove it.
    assert!(!fx.calls().iter().any(|c| c.starts_with("snapshot_remove")));
    assert!(!fx.workspace_dir().exists());
}

#[tokio::test]
async fn test_debug_layer_mount_failure_unwinds_snapshot() {
    let fx = Fixture::new(Script {
        fail_at: Some("mount_all dbg"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MountFailed { .. }));
    let calls = fx.calls();
    let tail: Vec<&str> = calls.iter().rev().take(2).rev().map(String::as_str).collect();
    assert_eq!(tail, ["mount_all dbg", "snapshot_remove dbg-1"]);
    assert!(
        !calls.iter().any(|c| c.starts_with("unmount_all")),
        "a failed mount leaves nothing mounted"
    );
    assert!(!fx.workspace_dir().exists());
}

#[tokio::test]
async fn test_overlay_failure_unmounts_debug_layer() {
    let fx = Fixture::new(Script {
        fail_at: Some("mount_all root"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MountFailed { .. }));
    let calls = fx.calls();
    let tail: Vec<&str> = calls.iter().rev().take(4).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        [
            "mount_all dbg",
            "mount_all root",
            // Composition failure takes the debug layer down with it, then
            // the regular unwind removes the snapshot.
            "unmount_all dbg",
            "snapshot_remove dbg-1",
        ]
    );
    assert!(!fx.workspace_dir().exists());
}

#[tokio::test]
async fn test_create_container_failure_unwinds_mounts() {
    let fx = Fixture::new(Script {
        fail_at: Some("create_container"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CreateFailed { .. }));
    let calls = fx.calls();
    let tail: Vec<&str> = calls.iter().rev().take(4).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        [
            "create_container dbg-1",
            "unmount_all root",
            "unmount_all dbg",
            "snapshot_remove dbg-1",
        ]
    );
    assert!(
        !calls.iter().any(|c| c.starts_with("delete_container")),
        "a container that was never created must not be deleted"
    );
}

#[tokio::test]
async fn test_task_failure_deletes_container() {
    let fx = Fixture::new(Script {
        fail_at: Some("new_task"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TaskFailed { .. }));
    let calls = fx.calls();
    let tail: Vec<&str> = calls.iter().rev().take(5).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        [
            "new_task dbg-1",
            "delete_container dbg-1",
            "unmount_all root",
            "unmount_all dbg",
            "snapshot_remove dbg-1",
        ]
    );
    assert!(!calls.iter().any(|c| c == "task.delete"));
}

#[tokio::test]
async fn test_teardown_failure_after_completion_surfaces() {
    let fx = Fixture::new(Script {
        fail_at: Some("unmount_all root"),
        exit_on_start: Some(0),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    // A leaked mount must be visible in the session result.
    assert!(matches!(err, Error::MountFailed { .. }));

    // Later teardown steps still ran.
    let calls = fx.calls();
    assert!(calls.iter().any(|c| c == "unmount_all dbg"));
    assert!(calls.iter().any(|c| c == "snapshot_remove dbg-1"));
    assert!(!fx.workspace_dir().exists());
}

#[tokio::test]
async fn test_acquisition_error_outranks_teardown_error() {
    let fx = Fixture::new(Script {
        fail_at: Some("new_task"),
        fail_also: Some("unmount_all root"),
        ..Script::default()
    });

    let err = fx
        .session(true, CancellationToken::new())
        .run()
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::TaskFailed { .. }),
        "the acquisition failure stays the primary error, got: {}",
        err
    );

    // The failed release did not stop the rest of the unwind.
    let calls = fx.calls();
    assert!(calls.iter().any(|c| c == "unmount_all dbg"));
    assert!(calls.iter().any(|c| c == "snapshot_remove dbg-1"));
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[tokio::test]
async fn test_cancellation_tears_down_and_reports_kill_code() {
    let fx = Fixture::new(Script::default());
    let cancel = CancellationToken::new();
    let session = fx.session(true, cancel.clone());

    let handle = tokio::spawn(session.run());
    fx.task.started.notified().await;
    cancel.cancel();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Cancelled);
    assert_eq!(
        outcome.exit_code, KILL_EXIT_CODE,
        "exit code observed from the killed task"
    );

    let calls = fx.calls();
    let teardown_start = calls.iter().position(|c| c == "task.delete").unwrap();
    let teardown: Vec<&str> = calls[teardown_start..].iter().map(String::as_str).collect();
    assert_eq!(
        teardown,
        [
            "task.delete",
            "delete_container dbg-1",
            "unmount_all root",
            "unmount_all dbg",
            "snapshot_remove dbg-1",
        ]
    );
    assert!(!fx.workspace_dir().exists());
}

#[tokio::test]
async fn test_cancel_before_start_reports_failure_code() {
    let fx = Fixture::new(Script::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = fx.session(true, cancel).run().await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Cancelled);
    assert_eq!(
        outcome.exit_code, 1,
        "no exit code was ever observed, so the fixed failure code applies"
    );
    assert!(
        fx.calls().is_empty(),
        "nothing was acquired, nothing to tear down"
    );
    assert!(!fx.workspace_dir().exists());
}

#[tokio::test]
async fn test_cancelled_outcome_survives_teardown_failure() {
    let fx = Fixture::new(Script {
        fail_at: Some("unmount_all root"),
        ..Script::default()
    });
    let cancel = CancellationToken::new();
    let session = fx.session(true, cancel.clone());

    let handle = tokio::spawn(session.run());
    fx.task.started.notified().await;
    cancel.cancel();

    // Cancellation stays an outcome even when a release step fails; the
    // failure is logged, not promoted.
    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Cancelled);
    assert_eq!(outcome.exit_code, KILL_EXIT_CODE);
}
