//! OCI runtime spec types and debug spec composition.
//!
//! The types here serve two purposes: tolerantly parsing a target
//! container's `config.json` (unknown fields ignored, most fields optional)
//! and serializing the composed debug container spec back out for the
//! runtime. [`compose_debug_spec`] is a pure function over those types: it
//! performs no I/O and fails only on malformed input.
//!
//! ## What the composed spec carries
//!
//! | Section       | Source                                               |
//! |---------------|------------------------------------------------------|
//! | root          | The composed overlay root (absolute path)            |
//! | process.args  | The requested debug command                          |
//! | process.env   | Defaults overridden by the target's environment      |
//! | mounts        | Defaults + target bind mounts with absolute sources  |
//! | capabilities  | Target's five sets, each extended with the grants    |
//! | namespaces    | Fresh mount/ipc/uts, target's PID namespace by path  |
//!
//! The debug container deliberately gets no network namespace entry: it
//! shares the host network so debug tooling can observe the target's
//! traffic without any wiring.

use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec (the subset this tool reads and writes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    #[serde(default = "default_spec_version")]
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<OciRoot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<OciProcess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
}

fn default_spec_version() -> String {
    OCI_RUNTIME_SPEC_VERSION.to_string()
}

/// OCI root filesystem config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: OciUser,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<OciCapabilities>,
    #[serde(default)]
    pub no_new_privileges: bool,
}

fn default_cwd() -> String {
    "/".to_string()
}

/// OCI user config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciUser {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

/// OCI process capability sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciCapabilities {
    #[serde(default)]
    pub ambient: Vec<String>,
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub inheritable: Vec<String>,
    #[serde(default)]
    pub permitted: Vec<String>,
}

/// OCI mount config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type", default)]
    pub mount_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciLinux {
    #[serde(default)]
    pub namespaces: Vec<OciNamespace>,
}

/// OCI namespace config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// =============================================================================
// Debug Spec Composition
// =============================================================================

/// Composes the runtime spec for the ephemeral debug container.
///
/// Pure over its inputs. The resulting spec:
///
/// - roots the container at `root_path` (the composed overlay mount);
/// - runs `command` with the target's environment layered over a default
///   `PATH`;
/// - copies target mounts whose source is an absolute host path, preserving
///   destination, type, and options (runtime-internal mounts like `proc`
///   have relative sources and are silently dropped);
/// - extends all five capability sets with `extra_caps`, creating the sets
///   if the target had none;
/// - disables privilege escalation unconditionally;
/// - joins the target's PID namespace via `/proc/<pid>/ns/pid` while
///   keeping fresh mount/ipc/uts namespaces and sharing the host network.
///
/// ## Errors
///
/// [`Error::InvalidSpec`] when `command` is empty, `root_path` is not
/// absolute, or `target_pid` is zero. No other failure is possible.
pub fn compose_debug_spec(
    target: &OciSpec,
    root_path: &Path,
    command: &[String],
    extra_caps: &[&str],
    target_pid: u32,
    tty: bool,
) -> Result<OciSpec> {
    if command.is_empty() {
        return Err(Error::InvalidSpec("debug command is empty".to_string()));
    }
    if !root_path.is_absolute() {
        return Err(Error::InvalidSpec(format!(
            "composed root path must be absolute: {}",
            root_path.display()
        )));
    }
    if target_pid == 0 {
        return Err(Error::InvalidSpec("target task pid is zero".to_string()));
    }

    let target_process = target.process.as_ref();

    let env = merge_env(
        default_env(),
        target_process.map(|p| p.env.as_slice()).unwrap_or(&[]),
    );

    let mut capabilities = target_process
        .and_then(|p| p.capabilities.clone())
        .unwrap_or_default();
    for set in [
        &mut capabilities.ambient,
        &mut capabilities.bounding,
        &mut capabilities.effective,
        &mut capabilities.inheritable,
        &mut capabilities.permitted,
    ] {
        append_caps(set, extra_caps);
    }

    let mut mounts = default_mounts();
    mounts.extend(
        target
            .mounts
            .iter()
            .filter(|m| Path::new(&m.source).is_absolute())
            .cloned(),
    );

    Ok(OciSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        root: Some(OciRoot {
            path: root_path.to_string_lossy().to_string(),
            readonly: false,
        }),
        process: Some(OciProcess {
            terminal: tty,
            user: OciUser::default(),
            args: command.to_vec(),
            env,
            cwd: "/".to_string(),
            capabilities: Some(capabilities),
            no_new_privileges: true,
        }),
        hostname: None,
        mounts,
        linux: Some(OciLinux {
            namespaces: vec![
                OciNamespace {
                    ns_type: "pid".to_string(),
                    path: Some(format!("/proc/{}/ns/pid", target_pid)),
                },
                OciNamespace {
                    ns_type: "ipc".to_string(),
                    path: None,
                },
                OciNamespace {
                    ns_type: "uts".to_string(),
                    path: None,
                },
                OciNamespace {
                    ns_type: "mount".to_string(),
                    path: None,
                },
            ],
        }),
    })
}

/// Baseline environment for the debug process.
fn default_env() -> Vec<String> {
    vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        "TERM=xterm".to_string(),
    ]
}

/// Overlays `overrides` onto `base`, replacing variables with the same name.
fn merge_env(base: Vec<String>, overrides: &[String]) -> Vec<String> {
    let mut env = base;
    for entry in overrides {
        let name = entry.split('=').next().unwrap_or(entry);
        if let Some(existing) = env
            .iter_mut()
            .find(|e| e.split('=').next().unwrap_or(e) == name)
        {
            *existing = entry.clone();
        } else {
            env.push(entry.clone());
        }
    }
    env
}

/// Appends capabilities to a set, skipping ones already present.
fn append_caps(set: &mut Vec<String>, extra: &[&str]) {
    for cap in extra {
        if !set.iter().any(|c| c == cap) {
            set.push(cap.to_string());
        }
    }
}

/// Baseline mounts every debug container needs regardless of the target.
fn default_mounts() -> Vec<OciMount> {
    vec![
        OciMount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        OciMount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "strictatime".to_string(),
                "mode=755".to_string(),
            ],
        },
        OciMount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "newinstance".to_string(),
                "ptmxmode=0666".to_string(),
                "mode=0620".to_string(),
            ],
        },
        OciMount {
            destination: "/dev/shm".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "shm".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "mode=1777".to_string(),
                "size=65536k".to_string(),
            ],
        },
        OciMount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "ro".to_string(),
            ],
        },
    ]
}
