//! # Content-Addressed Layer Store and Snapshot Views
//!
//! Stores pulled image layers by their cryptographic digest and
//! materializes per-session snapshot views from them.
//!
//! ## Storage Model
//!
//! ```text
//! <state-root>/store/
//! ├── blobs/
//! │   └── sha256/
//! │       ├── ab/
//! │       │   └── abcd1234...   (compressed layer blob)
//! │       └── cd/
//! │           └── cdef5678...
//! └── views/
//!     └── magikdbg-01890a.../
//!         └── fs/               (extracted layer chain)
//! ```
//!
//! Blobs are shared across sessions (content addressing deduplicates
//! identical layers); views are keyed by the debug container ID and removed
//! at session teardown.
//!
//! ## Security Model
//!
//! ### Digest Verification
//!
//! [`LayerStore::put_blob`] computes the content hash and verifies it
//! against the provided digest before storing. This catches registry
//! tampering and disk corruption before a blob is ever trusted.
//!
//! ### Path Traversal Protection
//!
//! Digests are sanitized before constructing blob paths, and every tar
//! entry extracted into a view is rejected if it contains `..` components
//! or an absolute path.
//!
//! ### Atomic Writes
//!
//! Blobs are written via a unique temp file + rename, so a crash never
//! leaves a partial blob under its final name.
//!
//! ## Whiteouts
//!
//! Layer archives mark deletions with `.wh.` prefixed entries. View
//! extraction applies them the way image unpackers do: the marked file or
//! directory from a lower layer is removed and the marker itself is not
//! materialized.

use crate::constants::{MAX_LAYER_SIZE, MAX_ROOTFS_SIZE, validate_container_id};
use crate::error::{Error, Result};
use crate::registry::LayerInfo;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

/// Content-addressed layer store with per-session views.
///
/// ## Thread Safety
///
/// Blob operations are independent and atomic, so concurrent sessions can
/// share a store. View keys are session-unique by construction, so view
/// operations never contend.
pub struct LayerStore {
    /// Base directory (`<state-root>/store`).
    base_dir: PathBuf,
}

impl LayerStore {
    /// Creates a store handle. No I/O happens here; [`LayerStore::init`]
    /// prepares the directory layout.
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Creates the on-disk layout.
    pub fn init(&self) -> Result<()> {
        for dir in [self.blobs_dir(), self.views_dir()] {
            fs::create_dir_all(&dir).map_err(|e| Error::StorageWriteFailed(format!(
                "failed to initialize {}: {}",
                dir.display(),
                e
            )))?;
        }
        debug!("layer store initialized at {}", self.base_dir.display());
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.base_dir.join("blobs")
    }

    fn views_dir(&self) -> PathBuf {
        self.base_dir.join("views")
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Gets a blob by digest.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Gets a blob path without reading it.
    ///
    /// # Security
    ///
    /// The digest is sanitized before the path is built: the algorithm must
    /// be a known hash name and the hash may contain hex characters only.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        // Digest format: sha256:abcd1234...
        // Stored as: blobs/sha256/ab/abcd1234...
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!("invalid digest algorithm '{}', defaulting to sha256", algo);
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();

        if safe_hash.len() != hash.len() {
            warn!(
                "digest hash contained non-hex characters, sanitized: {} -> {}",
                hash, safe_hash
            );
        }

        if safe_hash.is_empty() {
            // A path that never exists beats panicking on hostile input.
            return self.blobs_dir().join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.blobs_dir().join(safe_algo).join(prefix).join(&safe_hash)
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// # Security
    ///
    /// Only SHA-256 digests are accepted; the hash of `data` must match the
    /// digest exactly or the blob is rejected.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected_hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        if algo != "sha256" {
            return Err(Error::StorageWriteFailed(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                algo
            )));
        }

        let computed_hash = hex::encode(Sha256::digest(data));

        if computed_hash != expected_hash {
            return Err(Error::StorageWriteFailed(format!(
                "digest mismatch: expected {}, computed {}",
                expected_hash, computed_hash
            )));
        }

        let path = self.blob_path(digest);

        if path.exists() {
            debug!("blob {} already exists", digest);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // SECURITY: Unique temp name per writer; concurrent writers of the
        // same blob race only on the final atomic rename, and the content
        // is identical either way.
        let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
        let temp_path = path.with_extension(temp_name);
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("stored blob {} ({} bytes, verified)", digest, data.len());
        Ok(())
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Materializes a view of a layer chain under `views/<key>/fs`.
    ///
    /// Layers are applied bottom-to-top; later layers overwrite earlier
    /// ones and whiteout markers delete from them. Returns the extracted
    /// filesystem path. The key must be fresh: re-using a registered key is
    /// an error, matching snapshotter semantics.
    pub fn create_view(&self, key: &str, layers: &[LayerInfo]) -> Result<PathBuf> {
        validate_container_id(key).map_err(|reason| Error::SnapshotFailed {
            key: key.to_string(),
            reason: reason.to_string(),
        })?;

        let view_dir = self.views_dir().join(key);
        if view_dir.exists() {
            return Err(Error::SnapshotFailed {
                key: key.to_string(),
                reason: "view already exists".to_string(),
            });
        }

        let fs_dir = view_dir.join("fs");
        fs::create_dir_all(&fs_dir).map_err(|e| Error::SnapshotFailed {
            key: key.to_string(),
            reason: format!("failed to create view directory: {}", e),
        })?;

        let mut total_size = 0u64;
        for layer in layers {
            if let Err(e) = self.extract_layer(layer, &fs_dir, &mut total_size) {
                // Half-built views are useless; remove before reporting.
                let _ = fs::remove_dir_all(&view_dir);
                return Err(e);
            }
        }

        info!(
            key = %key,
            layers = layers.len(),
            "snapshot view materialized"
        );
        Ok(fs_dir)
    }

    /// Returns the filesystem path of an existing view.
    pub fn view_path(&self, key: &str) -> Option<PathBuf> {
        let fs_dir = self.views_dir().join(key).join("fs");
        fs_dir.exists().then_some(fs_dir)
    }

    /// Removes a view and its registration.
    pub fn remove_view(&self, key: &str) -> Result<()> {
        validate_container_id(key).map_err(|reason| Error::SnapshotFailed {
            key: key.to_string(),
            reason: reason.to_string(),
        })?;

        let view_dir = self.views_dir().join(key);
        if view_dir.exists() {
            fs::remove_dir_all(&view_dir).map_err(|e| Error::SnapshotFailed {
                key: key.to_string(),
                reason: format!("failed to remove view: {}", e),
            })?;
            debug!(key = %key, "snapshot view removed");
        }
        Ok(())
    }

    /// Extracts one gzip-compressed layer archive into `root`.
    fn extract_layer(&self, layer: &LayerInfo, root: &Path, total_size: &mut u64) -> Result<()> {
        debug!("extracting layer: {}", layer.digest);

        let data = self.get_blob(&layer.digest)?;

        if data.len() > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        let decoder = GzDecoder::new(&data[..]);
        let mut archive = Archive::new(decoder);

        for entry in archive.entries().map_err(|e| Error::LayerExtractionFailed {
            digest: layer.digest.clone(),
            reason: e.to_string(),
        })? {
            let mut entry = entry.map_err(|e| Error::LayerExtractionFailed {
                digest: layer.digest.clone(),
                reason: e.to_string(),
            })?;

            let path = entry.path().map_err(|e| Error::LayerExtractionFailed {
                digest: layer.digest.clone(),
                reason: e.to_string(),
            })?;

            // SECURITY: Check for path traversal
            let path_str = path.to_string_lossy();
            if path_str.contains("..") || path_str.starts_with('/') {
                return Err(Error::PathTraversal {
                    path: path_str.to_string(),
                });
            }

            // Handle whiteout files (deletions)
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if filename.starts_with(".wh.")
                && let Some(target) = filename.strip_prefix(".wh.")
            {
                let target_path = root
                    .join(path.parent().unwrap_or(Path::new("")))
                    .join(target);
                if target_path.exists() {
                    let _ = fs::remove_file(&target_path);
                    let _ = fs::remove_dir_all(&target_path);
                }
                continue;
            }

            *total_size += entry.size();
            if *total_size > MAX_ROOTFS_SIZE {
                return Err(Error::ImageTooLarge {
                    size: *total_size,
                    limit: MAX_ROOTFS_SIZE,
                });
            }

            entry
                .unpack_in(root)
                .map_err(|e| Error::LayerExtractionFailed {
                    digest: layer.digest.clone(),
                    reason: e.to_string(),
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(temp: &TempDir) -> LayerStore {
        let store = LayerStore::new(temp.path().to_path_buf());
        store.init().unwrap();
        store
    }

    #[test]
    fn test_blob_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);

        let data = b"hello world";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));

        store.put_blob(&digest, data).unwrap();
        assert!(store.has_blob(&digest));

        let retrieved = store.get_blob(&digest).unwrap();
        assert_eq!(retrieved, data);
    }

    #[test]
    fn test_blob_digest_verification_fails() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);

        let data = b"hello world";
        let wrong_digest =
            "sha256:0000000000000000000000000000000000000000000000000000000000000000";

        let result = store.put_blob(wrong_digest, data);
        assert!(result.is_err(), "should reject mismatched digest");
    }

    #[test]
    fn test_blob_path_structure() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);

        let digest = "sha256:abcd1234";
        let path = store.blob_path(digest);

        assert!(path.to_string_lossy().contains("sha256"));
        assert!(path.to_string_lossy().contains("ab"));
        assert!(path.to_string_lossy().ends_with("abcd1234"));
    }

    #[test]
    fn test_blob_path_sanitizes_hostile_digest() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);

        let path = store.blob_path("sha256:../../../etc/passwd");
        assert!(path.starts_with(temp.path()), "path must stay inside store");
    }
}
