//! Exit observation for container entry processes.
//!
//! Processes the engine forked itself are reaped with `waitpid`; processes
//! recovered after an engine restart were re-parented to init, so the
//! reaper falls back to polling for liveness and never sees a wait status
//! directly. Either way the wait status the init helper checkpointed into
//! the runtime directory takes precedence over whatever the kernel
//! reported: the helper knows the status of the command, the kernel only
//! knows the status of the helper.

use crate::constants::REAP_POLL_INTERVAL;
use crate::id::ContainerId;
use crate::paths;
use crate::sync::{Pending, Promise};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Starts observing `pid` and resolves with the container's wait status.
///
/// Resolves `None` when the exit can never be attributed (status file
/// unreadable and no wait status observed).
pub(crate) fn reap(runtime_dir: &Path, id: &ContainerId, pid: i32) -> Pending<Option<i32>> {
    let promise = Promise::new();
    let pending = promise.pending();
    let runtime_dir: PathBuf = runtime_dir.to_path_buf();
    let id = id.clone();

    tokio::spawn(async move {
        let raw = tokio::task::spawn_blocking(move || wait_for_exit(Pid::from_raw(pid)))
            .await
            .unwrap_or(None);
        promise.set(checkpointed_status(&runtime_dir, &id, raw));
    });

    pending
}

/// Blocks until `pid` is gone. Returns the raw wait status when this
/// process was the parent, `None` otherwise.
fn wait_for_exit(pid: Pid) -> Option<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(code << 8),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Some(signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }

    // Not our child (recovered after a restart). Poll until the pid
    // disappears; the checkpointed status file is the only record of how
    // it went.
    while kill(pid, None).is_ok() {
        std::thread::sleep(REAP_POLL_INTERVAL);
    }
    None
}

/// Resolves the authoritative status once the process is gone.
fn checkpointed_status(
    runtime_dir: &Path,
    id: &ContainerId,
    raw: Option<i32>,
) -> Option<i32> {
    // Containers without a runtime directory predate checkpointing; the
    // raw status is all there is.
    if !paths::runtime_path(runtime_dir, id).exists() {
        return raw;
    }

    match paths::read_status(runtime_dir, id) {
        Ok(Some(status)) => Some(status),
        // The init helper was interrupted before it could write the file:
        // it must have been SIGKILLed.
        Ok(None) => Some(Signal::SIGKILL as i32),
        Err(e) => {
            tracing::warn!(
                container = %id,
                error = %e,
                "Failed to read checkpointed container status"
            );
            None
        }
    }
}
