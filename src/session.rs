//! # Debug Session Orchestrator
//!
//! Drives one debug attach from start to finish: a strictly linear
//! acquisition sequence, a single cancellation point, and a centrally owned
//! teardown stack executed in reverse on every exit path.
//!
//! ## State Machine
//!
//! ```text
//! Init ──> Connected ──> TargetResolved ──> ImageReady ──> SnapshotReady
//!                                                              │
//!      Running <── TaskCreated <── ContainerCreated <── RootComposed
//!         │                                                    ▲
//!         │                                            WorkspaceReady
//!         └──> Terminal(Completed | Failed | Cancelled)
//! ```
//!
//! Each forward transition performs exactly one acquisition and, on
//! success, pushes its release action onto the teardown stack. Any failure
//! halts forward progress; cancellation can interrupt any suspension point.
//! Either way the stack unwinds completely before the outcome is reported.
//!
//! ## Teardown Order
//!
//! | Acquired (forward)        | Released (reverse)          |
//! |---------------------------|-----------------------------|
//! | snapshot view             | remove view                 |
//! | workspace directories     | remove workspace tree       |
//! | composed root mounts      | unmount root, then toolset  |
//! | debug container           | delete container            |
//! | debug task                | delete task (kills process) |
//!
//! Every release is attempted even when an earlier one fails; failures are
//! logged individually and the first one is kept as the teardown error.
//!
//! ## Cancellation
//!
//! Cancellation arrives through a [`CancellationToken`] and is observed at
//! every suspension point, so an interrupt during a slow image pull returns
//! promptly instead of hanging. Cancellation never kills the debug process
//! directly: it routes the orchestrator into the same teardown path, whose
//! task deletion does the killing. A session can be cancelled and complete
//! at the same time; the duplicate teardown is a harmless no-op.

use crate::config::SessionConfig;
use crate::console::ConsoleController;
use crate::constants::{DEBUG_CAPABILITIES, EXIT_COLLECT_TIMEOUT, EXIT_FAILURE_CODE, SESSION_DIR};
use crate::error::{Error, Result};
use crate::layerfs::{self, ComposedRoot};
use crate::runtime::{RuntimeClient, StreamConfig, Task};
use crate::spec::compose_debug_spec;
use crate::workspace::Workspace;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The debug process ran and exited on its own.
    Completed,
    /// An external interrupt tore the session down.
    Cancelled,
}

/// Terminal disposition of a session that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    /// Exit code to report: the debug process's own code when it produced
    /// one, otherwise [`EXIT_FAILURE_CODE`].
    pub exit_code: i32,
}

/// Session phases, in acquisition order. Logged on every transition.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Init,
    Connected,
    TargetResolved,
    ImageReady,
    SnapshotReady,
    WorkspaceReady,
    RootComposed,
    ContainerCreated,
    TaskCreated,
    Running,
}

fn enter(phase: Phase) {
    debug!(phase = ?phase, "session phase");
}

/// One pending release action. Pushed after the matching acquisition
/// succeeds, executed exactly once during unwind.
enum Teardown {
    SnapshotView { key: String },
    Workspace(Workspace),
    ComposedRoot(ComposedRoot),
    Container { id: String },
    Task(Arc<dyn Task>),
}

/// Release actions accumulated during acquisition, executed in reverse.
struct TeardownStack {
    steps: Vec<Teardown>,
}

impl TeardownStack {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn push(&mut self, step: Teardown) {
        self.steps.push(step);
    }

    /// Executes every pending release in reverse acquisition order.
    ///
    /// All steps are attempted regardless of individual failures. Each
    /// failure is logged; the first one is returned so callers can decide
    /// whether it becomes the session's primary error.
    async fn unwind(self, runtime: &dyn RuntimeClient) -> Option<Error> {
        let mut first_err = None;

        for step in self.steps.into_iter().rev() {
            let result = match step {
                Teardown::Task(task) => {
                    debug!("teardown: deleting debug task");
                    task.delete().await
                }
                Teardown::Container { id } => {
                    debug!("teardown: deleting debug container {}", id);
                    runtime.delete_container(&id).await
                }
                Teardown::ComposedRoot(root) => {
                    debug!("teardown: unmounting composed root");
                    root.unmount(runtime).await
                }
                Teardown::Workspace(ws) => {
                    debug!("teardown: releasing workspace");
                    ws.release()
                }
                Teardown::SnapshotView { key } => {
                    debug!("teardown: removing snapshot view {}", key);
                    runtime.snapshot_remove(&key).await
                }
            };

            if let Err(e) = result {
                error!("teardown step failed: {}", e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        first_err
    }
}

/// What the forward sequence produced before teardown ran.
enum DriveOutcome {
    /// The debug process exited with this code.
    Completed(i32),
    /// Cancellation interrupted the session. The receiver, when present,
    /// may still observe the exit code forced by task deletion.
    Cancelled(Option<oneshot::Receiver<i32>>),
}

/// One debug attach, from configuration to terminal disposition.
pub struct Session {
    config: SessionConfig,
    runtime: Arc<dyn RuntimeClient>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        runtime: Arc<dyn RuntimeClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            runtime,
            cancel,
        }
    }

    /// Runs the session to its terminal state.
    ///
    /// Returns `Ok` with the outcome for sessions that completed or were
    /// cancelled, and `Err` for sessions that failed during acquisition.
    /// The teardown stack is fully unwound on every path before this
    /// returns.
    pub async fn run(self) -> Result<SessionOutcome> {
        let mut stack = TeardownStack::new();

        let driven = match self.drive(&mut stack).await {
            Ok(outcome) => Ok(outcome),
            // Cancellation between Running and any earlier phase lands
            // here; it is an outcome, not a failure.
            Err(Error::Cancelled) => Ok(DriveOutcome::Cancelled(None)),
            Err(e) => Err(e),
        };

        let teardown_err = stack.unwind(self.runtime.as_ref()).await;

        match driven {
            Err(e) => {
                // Teardown failures were logged above; the acquisition
                // error stays the primary cause.
                Err(e)
            }
            Ok(DriveOutcome::Completed(code)) => {
                if let Some(e) = teardown_err {
                    return Err(e);
                }
                info!("debug session completed, exit code {}", code);
                Ok(SessionOutcome {
                    status: SessionStatus::Completed,
                    exit_code: code,
                })
            }
            Ok(DriveOutcome::Cancelled(exit_rx)) => {
                let exit_code = match exit_rx {
                    Some(rx) => match tokio::time::timeout(EXIT_COLLECT_TIMEOUT, rx).await {
                        Ok(Ok(code)) => code,
                        _ => EXIT_FAILURE_CODE,
                    },
                    None => EXIT_FAILURE_CODE,
                };
                info!("debug session cancelled, exit code {}", exit_code);
                Ok(SessionOutcome {
                    status: SessionStatus::Cancelled,
                    exit_code,
                })
            }
        }
    }

    /// The forward acquisition sequence.
    ///
    /// Every runtime call is raced against the cancellation token, so a
    /// pending interrupt converts the next suspension point into
    /// [`Error::Cancelled`]. Successful acquisitions push their release
    /// action before the next step runs.
    async fn drive(&self, stack: &mut TeardownStack) -> Result<DriveOutcome> {
        let cfg = &self.config;
        enter(Phase::Init);

        self.checked(self.runtime.connect()).await?;
        enter(Phase::Connected);

        let target = self
            .checked(self.runtime.load_container(&cfg.target_id))
            .await?;
        let target_spec = self.checked(self.runtime.container_spec(&target)).await?;
        let target_task = self.checked(self.runtime.container_task(&target)).await?;
        enter(Phase::TargetResolved);
        info!(
            "target {} resolved, task pid {}",
            cfg.target_id, target_task.pid
        );

        let image = self.checked(self.runtime.pull_image(&cfg.image)).await?;
        enter(Phase::ImageReady);

        // The view is keyed by the debug container ID, which the runtime
        // namespace already guarantees is unique per session.
        let view_mounts = self
            .checked(self.runtime.snapshot_view(&cfg.container_id, &image))
            .await?;
        stack.push(Teardown::SnapshotView {
            key: cfg.container_id.clone(),
        });
        enter(Phase::SnapshotReady);

        let workspace = Workspace::create(
            &cfg.address.join(SESSION_DIR),
            &cfg.container_id,
            !cfg.read_only,
        )?;
        stack.push(Teardown::Workspace(workspace.clone()));
        enter(Phase::WorkspaceReady);

        let composed = self
            .checked(layerfs::compose_root(
                self.runtime.as_ref(),
                &workspace,
                &view_mounts,
                &target.root,
            ))
            .await?;
        let root_path = composed.path().to_path_buf();
        stack.push(Teardown::ComposedRoot(composed));
        enter(Phase::RootComposed);

        let debug_spec = compose_debug_spec(
            &target_spec,
            &root_path,
            &cfg.command,
            DEBUG_CAPABILITIES,
            target_task.pid,
            cfg.tty,
        )?;
        self.checked(self.runtime.create_container(&cfg.container_id, &debug_spec))
            .await?;
        stack.push(Teardown::Container {
            id: cfg.container_id.clone(),
        });
        enter(Phase::ContainerCreated);

        let console_socket = cfg
            .tty
            .then(|| workspace.streams_dir().join("console.sock"));
        let task = self
            .checked(self.runtime.new_task(
                &cfg.container_id,
                StreamConfig {
                    tty: cfg.tty,
                    console_socket,
                },
            ))
            .await?;
        stack.push(Teardown::Task(Arc::clone(&task)));
        let mut exit_rx = self.checked(task.wait()).await?;
        enter(Phase::TaskCreated);

        // Raw mode and the pumps must be in place before the first byte of
        // output; the initial resize lands before the process starts.
        let console = ConsoleController::attach(Arc::clone(&task), cfg.tty)?;
        if cfg.tty {
            console.resize_to_current().await;
            console.spawn_resize_listener()?;
        }

        self.checked(task.start()).await?;
        enter(Phase::Running);
        info!("debug container {} running", cfg.container_id);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            status = &mut exit_rx => {
                let code = status.map_err(|_| Error::TaskFailed {
                    id: cfg.container_id.clone(),
                    reason: "exit watcher ended without reporting a status".to_string(),
                })?;
                return Ok(DriveOutcome::Completed(code));
            }
        }

        info!("cancellation requested, tearing down session");
        Ok(DriveOutcome::Cancelled(Some(exit_rx)))
    }

    /// Races a future against cancellation.
    async fn checked<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}
