//! On-disk layout of the engine's checkpoint state.
//!
//! The runtime directory mirrors the container hierarchy:
//!
//! ```text
//! <runtime_dir>/containers/<a>/
//!     pid                     # entry process pid, written post-fork
//!     status                  # wait status, written by the init helper
//!     containers/<b>/
//!         pid
//!         termination         # nested containers checkpoint their
//!                             # termination until the root goes away
//! ```
//!
//! Sandboxes nest the same way underneath the root container's sandbox.
//! Checkpoint writes go through a temp file plus rename so a crash never
//! leaves a half-written file behind.

use crate::constants::{
    CONTAINER_DIRECTORY, FORKED_PID_FILE, META_DIRECTORY, PID_FILE, STATUS_FILE, TERMINATION_FILE,
};
use crate::container::ContainerTermination;
use crate::error::{Error, Result};
use crate::id::ContainerId;
use std::fs;
use std::path::{Path, PathBuf};

// =============================================================================
// Path Builders
// =============================================================================

/// The runtime (checkpoint) directory of a container.
#[must_use]
pub fn runtime_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    let mut path = runtime_dir.to_path_buf();
    for component in id.components() {
        path.push(CONTAINER_DIRECTORY);
        path.push(component);
    }
    path
}

/// The sandbox of `id`, derived from its root container's sandbox.
///
/// For a top-level id this is the root sandbox itself.
#[must_use]
pub fn sandbox_path(root_directory: &Path, id: &ContainerId) -> PathBuf {
    let mut path = root_directory.to_path_buf();
    for component in id.components().into_iter().skip(1) {
        path.push(CONTAINER_DIRECTORY);
        path.push(component);
    }
    path
}

/// Where the forked pid is checkpointed in the agent's meta directory.
#[must_use]
pub fn forked_pid_path(
    work_dir: &Path,
    slave_id: &str,
    framework_id: &str,
    executor_id: &str,
    id: &ContainerId,
) -> PathBuf {
    work_dir
        .join(META_DIRECTORY)
        .join("slaves")
        .join(slave_id)
        .join("frameworks")
        .join(framework_id)
        .join("executors")
        .join(executor_id)
        .join("runs")
        .join(id.value())
        .join("pids")
        .join(FORKED_PID_FILE)
}

fn pid_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    runtime_path(runtime_dir, id).join(PID_FILE)
}

fn status_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    runtime_path(runtime_dir, id).join(STATUS_FILE)
}

fn termination_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    runtime_path(runtime_dir, id).join(TERMINATION_FILE)
}

// =============================================================================
// Checkpoint I/O
// =============================================================================

/// Writes `contents` to `path` through a temp file and a rename.
pub fn checkpoint(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("checkpoint path '{}' has no parent", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Checkpoints the forked pid into the container's runtime directory.
pub fn checkpoint_pid(runtime_dir: &Path, id: &ContainerId, pid: i32) -> Result<()> {
    checkpoint(&pid_path(runtime_dir, id), &pid.to_string())
}

fn read_numeric(path: &Path) -> Result<Option<i32>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let trimmed = contents.trim();
    if trimmed.is_empty() {
        // A crash between open and write leaves an empty file; callers
        // treat that the same as no checkpoint at all.
        return Ok(None);
    }

    trimmed
        .parse::<i32>()
        .map(Some)
        .map_err(|e| Error::RecoveryFailed(format!("malformed checkpoint '{}': {e}", path.display())))
}

/// Reads back the checkpointed pid, if present.
pub fn read_pid(runtime_dir: &Path, id: &ContainerId) -> Result<Option<i32>> {
    read_numeric(&pid_path(runtime_dir, id))
}

/// Reads back the wait status the init helper checkpointed, if present.
pub fn read_status(runtime_dir: &Path, id: &ContainerId) -> Result<Option<i32>> {
    read_numeric(&status_path(runtime_dir, id))
}

/// Whether a nested container already checkpointed its termination.
#[must_use]
pub fn termination_exists(runtime_dir: &Path, id: &ContainerId) -> bool {
    termination_path(runtime_dir, id).exists()
}

/// Checkpoints a nested container's termination record.
pub fn write_termination(
    runtime_dir: &Path,
    id: &ContainerId,
    termination: &ContainerTermination,
) -> Result<()> {
    let serialized = serde_json::to_string(termination)?;
    checkpoint(&termination_path(runtime_dir, id), &serialized)
}

/// Reads back a nested container's checkpointed termination, if present.
pub fn read_termination(
    runtime_dir: &Path,
    id: &ContainerId,
) -> Result<Option<ContainerTermination>> {
    let path = termination_path(runtime_dir, id);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

// =============================================================================
// Runtime Directory Scan
// =============================================================================

/// All container ids checkpointed under the runtime directory, parents
/// strictly before their children.
pub fn container_ids(runtime_dir: &Path) -> Result<Vec<ContainerId>> {
    let mut ids = Vec::new();
    scan(runtime_dir, None, &mut ids)?;
    Ok(ids)
}

fn scan(dir: &Path, parent: Option<&ContainerId>, ids: &mut Vec<ContainerId>) -> Result<()> {
    let containers = dir.join(CONTAINER_DIRECTORY);
    let entries = match fs::read_dir(&containers) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(Error::RecoveryFailed(format!(
                "non-unicode entry '{}' in runtime directory",
                entry.path().display()
            )));
        };

        let id = match parent {
            Some(parent) => parent.try_child(name),
            None => ContainerId::try_new(name),
        };

        // A directory the engine could not have created is not ours.
        let Some(id) = id else {
            tracing::warn!(
                entry = %entry.path().display(),
                "Skipping foreign entry in runtime directory"
            );
            continue;
        };

        ids.push(id.clone());
        scan(&entry.path(), Some(&id), ids)?;
    }

    Ok(())
}
