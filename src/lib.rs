//! # magikdbg
//!
//! **Interactive Debug Sessions for Running Containers**
//!
//! This crate attaches an ephemeral debug container to an already-running
//! target container. The debug container shares the target's PID namespace,
//! carries a ptrace grant, and sees a layered root filesystem that stacks a
//! pulled debug toolset image over the target's own root, so the target can
//! be inspected with tools it never shipped.
//!
//! # Session Pipeline
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                            magikdbg                                │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐    │
//! │  │                    Session Orchestrator                    │    │
//! │  │  connect → resolve target → pull image → snapshot view    │    │
//! │  │  → workspace → layered root → debug spec → container      │    │
//! │  │  → task + console → start → wait / cancel → teardown      │    │
//! │  └────────────────────────────────────────────────────────────┘    │
//! │        │                  │                     │                  │
//! │  ┌───────────┐     ┌────────────┐       ┌──────────────┐          │
//! │  │ LayerStore │     │  layerfs   │       │   console    │          │
//! │  │ blobs +    │     │ overlay    │       │ raw mode,    │          │
//! │  │ views      │     │ composition│       │ pumps, winsz │          │
//! │  └───────────┘     └────────────┘       └──────────────┘          │
//! ├────────────────────────────────────────────────────────────────────┤
//! │              RuntimeClient trait (runtime.rs)                      │
//! │         NativeRuntime: libcontainer + mount syscalls               │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Teardown Guarantee
//!
//! Every successful acquisition pushes a release action; the stack unwinds
//! in reverse on success, failure, and cancellation alike:
//!
//! | Acquisition        | Release                      |
//! |--------------------|------------------------------|
//! | snapshot view      | remove view                  |
//! | workspace          | remove directory tree        |
//! | layered root       | unmount root, then toolset   |
//! | debug container    | delete container and bundle  |
//! | debug task         | kill process, collect exit   |
//!
//! # Key Security Properties
//!
//! - **Bounded pulls**: image references are validated, layer sizes and
//!   counts capped, downloads time-limited (see [`registry`]).
//! - **Digest verification**: every layer blob is hashed before it enters
//!   the store (see [`store::LayerStore::put_blob`]).
//! - **Path traversal protection**: layer extraction rejects `..` and
//!   absolute entry paths.
//! - **Scoped privilege**: the debug container gets `CAP_SYS_PTRACE` on
//!   top of the target's capability sets, with privilege escalation
//!   disabled; it is never fully privileged.
//! - **Target isolation**: read-only sessions cannot write through the
//!   overlay; writable sessions confine writes to the session's upper
//!   directory.

pub mod config;
pub mod console;
pub mod constants;
pub mod error;
pub mod layerfs;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod spec;
pub mod store;
pub mod workspace;

pub mod runtimes;

// Re-exports
pub use config::SessionConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use registry::{ImageHandle, LayerInfo, pull_image};
pub use runtime::{Mount, RuntimeClient, StreamConfig, TargetHandle, TargetTask, Task};
pub use runtimes::NativeRuntime;
pub use session::{Session, SessionOutcome, SessionStatus};
pub use spec::{OciSpec, compose_debug_spec};
pub use store::LayerStore;
pub use workspace::Workspace;
