//! Session configuration.
//!
//! A [`SessionConfig`] is built once from command-line arguments before the
//! session starts and never mutated afterwards. All defaulting (image,
//! command, generated container ID) happens here, so the orchestrator only
//! ever sees fully resolved values.

use crate::constants::{
    DEFAULT_COMMAND, DEFAULT_DEBUG_IMAGE, DEFAULT_RUNTIME_ROOT, validate_container_id,
};
use std::path::PathBuf;

/// Immutable configuration for one debug session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Runtime state root (control plane address).
    pub address: PathBuf,
    /// ID of the running container to attach to.
    pub target_id: String,
    /// Debug toolset image reference.
    pub image: String,
    /// ID for the ephemeral debug container. Unique per session by default
    /// and doubles as the snapshot view key and workspace name.
    pub container_id: String,
    /// Command executed inside the debug container.
    pub command: Vec<String>,
    /// Allocate a terminal and wire the interactive console.
    pub tty: bool,
    /// Compose the debug root read-only (no copy-on-write upper layer).
    pub read_only: bool,
}

impl SessionConfig {
    /// Parses a session configuration from command-line arguments.
    ///
    /// Expects the argument list without the program name:
    /// flags (`--address`, `--image`, `--id`, `--tty`/`--no-tty`,
    /// `--read-only`/`--writable`) followed by the target container ID and
    /// an optional command vector.
    pub fn from_args(args: &[String]) -> std::result::Result<Self, String> {
        let mut address = PathBuf::from(DEFAULT_RUNTIME_ROOT);
        let mut image = DEFAULT_DEBUG_IMAGE.to_string();
        let mut container_id = None;
        let mut tty = true;
        let mut read_only = true;
        let mut positional: Vec<String> = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--address" | "-a" => {
                    if i + 1 < args.len() {
                        address = PathBuf::from(&args[i + 1]);
                        i += 2;
                    } else {
                        return Err("--address requires a path".to_string());
                    }
                }
                "--image" | "-i" => {
                    if i + 1 < args.len() {
                        image = args[i + 1].clone();
                        i += 2;
                    } else {
                        return Err("--image requires a reference".to_string());
                    }
                }
                "--id" => {
                    if i + 1 < args.len() {
                        container_id = Some(args[i + 1].clone());
                        i += 2;
                    } else {
                        return Err("--id requires a container id".to_string());
                    }
                }
                "--tty" | "-t" => {
                    tty = true;
                    i += 1;
                }
                "--no-tty" => {
                    tty = false;
                    i += 1;
                }
                "--read-only" => {
                    read_only = true;
                    i += 1;
                }
                "--writable" | "-w" => {
                    read_only = false;
                    i += 1;
                }
                flag if flag.starts_with('-') => {
                    return Err(format!("unknown flag: {}", flag));
                }
                _ => {
                    // First positional is the target; the rest is the command.
                    positional.extend_from_slice(&args[i..]);
                    break;
                }
            }
        }

        let mut positional = positional.into_iter();
        let target_id = positional
            .next()
            .ok_or_else(|| "target container id is required".to_string())?;

        let command: Vec<String> = positional.collect();
        let command = if command.is_empty() {
            DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect()
        } else {
            command
        };

        let container_id =
            container_id.unwrap_or_else(|| format!("magikdbg-{}", uuid::Uuid::now_v7().simple()));

        validate_container_id(&target_id)
            .map_err(|reason| format!("invalid target container id: {}", reason))?;
        validate_container_id(&container_id)
            .map_err(|reason| format!("invalid debug container id: {}", reason))?;

        Ok(Self {
            address,
            target_id,
            image,
            container_id,
            command,
            tty,
            read_only,
        })
    }
}
