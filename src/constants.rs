//! # Debug Session Constants
//!
//! Defines resource limits, timeouts, and defaults for the debug session
//! layer. These constants are the **single source of truth** for
//! security-critical bounds throughout the codebase.
//!
//! ## Security Rationale
//!
//! All limits are chosen to prevent resource exhaustion while allowing
//! legitimate debug images. Each constant includes the bounded value, its
//! units, and the attack vector it mitigates.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: Uses size limits and timeouts for image pulling
//! - [`crate::store`]: Uses size limits for view extraction
//! - [`crate::runtimes`]: Uses the console handshake timeout

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits prevent disk exhaustion from malicious or malformed debug
// images. MAX_ROOTFS_SIZE (4 GiB) is the actual extraction bound; the
// per-layer limit bounds individual downloads.
// =============================================================================

/// Maximum OCI image reference length in bytes.
///
/// **Security**: Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed OCI layer (512 MiB).
///
/// **Security**: Prevents disk exhaustion during layer download. Each layer
/// is validated against this limit before writing to blob storage.
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total extracted view size (4 GiB).
///
/// **Security**: Bounds disk usage of a single snapshot view. Enforced
/// during tar extraction, accumulating across all layers.
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in a debug image.
///
/// **Security**: Prevents excessive extraction time from images with
/// pathological layer counts.
pub const MAX_LAYERS: usize = 128;

// =============================================================================
// Timeouts
// =============================================================================
//
// All network and handshake operations MUST have timeouts to prevent
// indefinite hangs. Defaults are generous for slow networks but bounded.
// =============================================================================

/// Timeout for image pull operations (5 minutes).
///
/// **Security**: Prevents indefinite hangs from unresponsive registries
/// or network partitions. Applies to the manifest fetch and each layer.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for receiving the console descriptor from a freshly created task.
///
/// The runtime's init process connects back over the console socket during
/// task creation, so the handshake normally completes in milliseconds.
pub const CONSOLE_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait after teardown for the exit watcher to report a code
/// for a task that was killed by cancellation.
pub const EXIT_COLLECT_TIMEOUT: Duration = Duration::from_millis(250);

// =============================================================================
// Session Defaults
// =============================================================================

/// Default runtime state root.
///
/// Holds container state, runtime bundles, the layer store, and per-session
/// workspaces. Overridable with `--address`.
pub const DEFAULT_RUNTIME_ROOT: &str = "/run/magikdbg";

/// Default debug toolset image.
pub const DEFAULT_DEBUG_IMAGE: &str = "docker.io/library/ubuntu:22.04";

/// Default debug command: an interactive login shell.
pub const DEFAULT_COMMAND: &[&str] = &["/bin/bash", "-l"];

/// Capabilities granted to the debug process on top of the target's sets.
///
/// CAP_SYS_PTRACE lets debuggers in the shared PID namespace attach to
/// target processes.
pub const DEBUG_CAPABILITIES: &[&str] = &["CAP_SYS_PTRACE"];

/// Process exit code reported when the session fails before the debug task
/// produced its own exit code.
pub const EXIT_FAILURE_CODE: i32 = 1;

// =============================================================================
// Storage Paths
// =============================================================================
//
// Subdirectories under the runtime state root. All paths are relative to
// the configured `--address`.
// =============================================================================

/// Subdirectory for container state (compatible with youki's state layout).
pub const CONTAINER_STATE_DIR: &str = "containers";

/// Subdirectory for generated runtime bundles (config.json per container).
pub const BUNDLE_DIR: &str = "bundles";

/// Subdirectory for the content-addressed layer store and snapshot views.
pub const STORE_DIR: &str = "store";

/// Subdirectory for per-session scratch workspaces.
pub const SESSION_DIR: &str = "sessions";

// =============================================================================
// OCI Spec Versions
// =============================================================================

/// OCI Runtime Spec version for generated `config.json`.
///
/// See: <https://github.com/opencontainers/runtime-spec/releases>
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container names/IDs.
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal when container names are used in filesystem paths.
/// Snapshot view keys and workspace names derive from container IDs, so the
/// same allowlist covers them.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container ID length.
///
/// **Rationale**: 128 characters accommodates UUID-suffixed session names.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container ID for safety.
///
/// # Security
///
/// Ensures container IDs are non-empty, bounded by `MAX_CONTAINER_ID_LEN`,
/// and drawn from `CONTAINER_NAME_VALID_CHARS` only.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_validation() {
        assert!(validate_container_id("magikdbg-01890a5d").is_ok());
        assert!(validate_container_id("a_b-C9").is_ok());
        assert!(validate_container_id("").is_err());
        assert!(validate_container_id("../escape").is_err());
        assert!(validate_container_id("has space").is_err());
        assert!(validate_container_id(&"x".repeat(MAX_CONTAINER_ID_LEN + 1)).is_err());
    }
}
