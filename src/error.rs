//! Error types for the debug session layer.
//!
//! Every acquisition failure is fatal for the session: there are no retries,
//! and the orchestrator unwinds all previously acquired resources before the
//! error reaches the caller. The only recoverable class is terminal resize
//! delivery, which is logged at the call site and never surfaces here.

use std::path::PathBuf;

/// Result type alias for debug session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a debug session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Runtime Connection Errors
    // =========================================================================
    /// The container runtime control plane is unreachable or unusable.
    #[error("failed to connect to runtime at {address}: {reason}")]
    Connection { address: PathBuf, reason: String },

    /// Target container not found in the runtime namespace.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Target container exists but has no running task to attach to.
    #[error("container '{0}' has no running task")]
    NoTask(String),

    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Layer download or extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Snapshot Errors
    // =========================================================================
    /// Snapshot view creation or removal failed.
    #[error("snapshot view '{key}' failed: {reason}")]
    SnapshotFailed { key: String, reason: String },

    // =========================================================================
    // Mount Errors
    // =========================================================================
    /// A mount or unmount operation failed.
    #[error("mount operation at {target} failed: {reason}")]
    MountFailed { target: PathBuf, reason: String },

    // =========================================================================
    // Container/Task Lifecycle Errors
    // =========================================================================
    /// Debug container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Debug container delete failed.
    #[error("failed to delete container '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Task creation, start, or control failed.
    #[error("task operation on '{id}' failed: {reason}")]
    TaskFailed { id: String, reason: String },

    // =========================================================================
    // Spec Composition Errors
    // =========================================================================
    /// The target spec (or the composition inputs) are malformed.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Interactive console wiring failed.
    #[error("console setup failed: {0}")]
    ConsoleSetup(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Blob not found in the layer store.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Layer store write failed.
    #[error("failed to write to layer store: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Host resources (disk, inodes) exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Missing privileges for an operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Flow Control Errors
    // =========================================================================
    /// The session was interrupted before completion.
    #[error("session cancelled")]
    Cancelled,

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}
