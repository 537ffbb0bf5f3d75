//! # OCI Registry Client
//!
//! Pulls debug toolset images from OCI-compliant registries and lands their
//! layers in the content-addressed [`LayerStore`](crate::store::LayerStore).
//!
//! ## Pull Flow
//!
//! ```text
//! reference ──> validate ──> resolve manifest ──> pull layers ──> ImageHandle
//!                              │                    │
//!                              │ (index: pick       │ (skip layers already
//!                              │  linux/<arch>)     │  in the blob store)
//! ```
//!
//! ## Security Model
//!
//! - **Reference validation**: length-capped, no whitespace or control
//!   characters, parsed by the OCI reference grammar before any network I/O.
//! - **HTTPS only**: the client never falls back to plain HTTP.
//! - **Anonymous pulls**: debug toolset images are public; no credential
//!   handling exists in this path.
//! - **Size limits**: per-layer and layer-count caps are enforced on the
//!   manifest before a single blob byte is fetched, and re-checked on the
//!   downloaded data.
//! - **Digest verification**: the blob store hashes every layer on insert,
//!   so a tampered registry response cannot be referenced later.
//! - **Timeouts**: every network operation is bounded by
//!   [`IMAGE_PULL_TIMEOUT`].

use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN, MAX_LAYERS, MAX_LAYER_SIZE};
use crate::error::{Error, Result};
use crate::store::LayerStore;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::time::timeout;
use tracing::{debug, info};

/// A pulled image whose layers are all resident in the local blob store.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Reference the image was pulled by.
    pub reference: String,
    /// Digest of the resolved, platform-specific manifest.
    pub digest: String,
    /// Layer chain, bottom to top.
    pub layers: Vec<LayerInfo>,
}

/// One layer of a pulled image.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Content digest (`sha256:...`).
    pub digest: String,
    /// Compressed size in bytes, from the manifest descriptor.
    pub size: u64,
}

/// Pulls an image and stores its layers, returning a handle that the
/// snapshotter can materialize views from.
///
/// Layers already present in the store are not re-downloaded.
pub async fn pull_image(image_ref: &str, store: &LayerStore) -> Result<ImageHandle> {
    validate_image_reference(image_ref)?;

    let reference = Reference::try_from(image_ref).map_err(|e| Error::InvalidImageReference {
        reference: image_ref.to_string(),
        reason: e.to_string(),
    })?;

    info!("pulling image: {}", reference);

    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });
    let auth = RegistryAuth::Anonymous;

    let (manifest, digest) = resolve_manifest(&client, &reference, &auth).await?;

    if manifest.layers.len() > MAX_LAYERS {
        return Err(Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: format!(
                "manifest has {} layers, limit is {}",
                manifest.layers.len(),
                MAX_LAYERS
            ),
        });
    }

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for descriptor in &manifest.layers {
        if descriptor.size > MAX_LAYER_SIZE as i64 {
            return Err(Error::ImageTooLarge {
                size: descriptor.size.max(0) as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        if store.has_blob(&descriptor.digest) {
            debug!("layer {} already in store, skipping pull", descriptor.digest);
        } else {
            let mut data = Vec::with_capacity(descriptor.size.max(0) as usize);
            timeout(
                IMAGE_PULL_TIMEOUT,
                client.pull_blob(&reference, descriptor, &mut data),
            )
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("pull layer {}", descriptor.digest),
                duration: IMAGE_PULL_TIMEOUT,
            })?
            .map_err(|e| Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!("layer {}: {}", descriptor.digest, e),
            })?;

            // SECURITY: The manifest's size claim was checked above; the
            // actual payload is checked again here.
            if data.len() > MAX_LAYER_SIZE {
                return Err(Error::ImageTooLarge {
                    size: data.len() as u64,
                    limit: MAX_LAYER_SIZE as u64,
                });
            }

            store.put_blob(&descriptor.digest, &data)?;
        }

        layers.push(LayerInfo {
            digest: descriptor.digest.clone(),
            size: descriptor.size.max(0) as u64,
        });
    }

    info!(
        "pulled image {} ({} layers, manifest {})",
        image_ref,
        layers.len(),
        digest
    );

    Ok(ImageHandle {
        reference: image_ref.to_string(),
        digest,
        layers,
    })
}

/// Resolves a reference to a platform-specific image manifest.
///
/// Multi-arch references return an image index; the entry matching the host
/// platform is followed one level. Nested indexes are rejected.
async fn resolve_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
) -> Result<(OciImageManifest, String)> {
    let (manifest, digest) = pull_manifest_bounded(client, reference, auth).await?;

    match manifest {
        OciManifest::Image(image) => Ok((image, digest)),
        OciManifest::ImageIndex(index) => {
            let (os, arch) = host_platform();
            let entry = index
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == os && p.architecture == arch)
                })
                .ok_or_else(|| Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: format!("image index has no manifest for {}/{}", os, arch),
                })?;

            debug!(
                "resolved index to {} for platform {}/{}",
                entry.digest, os, arch
            );

            let platform_ref = Reference::with_digest(
                reference.registry().to_string(),
                reference.repository().to_string(),
                entry.digest.clone(),
            );
            let (manifest, digest) = pull_manifest_bounded(client, &platform_ref, auth).await?;
            match manifest {
                OciManifest::Image(image) => Ok((image, digest)),
                OciManifest::ImageIndex(_) => Err(Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: "image index points at another index".to_string(),
                }),
            }
        }
    }
}

async fn pull_manifest_bounded(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
) -> Result<(OciManifest, String)> {
    timeout(IMAGE_PULL_TIMEOUT, client.pull_manifest(reference, auth))
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {}", reference),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: e.to_string(),
        })
}

/// Maps the compile-time target to OCI platform `(os, architecture)` strings.
fn host_platform() -> (&'static str, &'static str) {
    let arch = if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else if cfg!(target_arch = "riscv64") {
        "riscv64"
    } else {
        "amd64"
    };
    ("linux", arch)
}

/// Validates an image reference before it reaches the parser or the network.
fn validate_image_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "empty reference".to_string(),
        });
    }

    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: format!("{}...", &reference[..64]),
            reason: format!(
                "reference length {} exceeds limit {}",
                reference.len(),
                MAX_IMAGE_REF_LEN
            ),
        });
    }

    // SECURITY: References never contain whitespace or control characters;
    // reject early rather than trusting the parser's error paths.
    if reference
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "reference contains whitespace or control characters".to_string(),
        });
    }

    Ok(())
}
