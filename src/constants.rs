//! Constants for the orchestration engine.
//!
//! File names, directory layout pieces, and timing knobs live here so the
//! on-disk contract with the launch helper stays in one place.

use std::time::Duration;

// =============================================================================
// Runtime Directory Layout
// =============================================================================

/// Subdirectory under the runtime dir (and under each container's runtime
/// dir) that holds per-container state. Nested containers recurse:
/// `<runtime>/containers/<a>/containers/<b>`.
pub const CONTAINER_DIRECTORY: &str = "containers";

/// ASCII decimal pid of the container's entry process, written post-fork.
pub const PID_FILE: &str = "pid";

/// Wait status written by the in-container init helper when the entry
/// process exits. Absent means the helper was killed before writing.
pub const STATUS_FILE: &str = "status";

/// Serialized termination record, checkpointed for nested containers only.
pub const TERMINATION_FILE: &str = "termination";

// =============================================================================
// Agent Meta Checkpoints
// =============================================================================

/// Root of the agent's checkpoint area, relative to the work dir.
pub const META_DIRECTORY: &str = "meta";

/// File holding the forked pid in the agent's per-run meta directory.
pub const FORKED_PID_FILE: &str = "forked.pid";

// =============================================================================
// Launch Helper
// =============================================================================

/// Name of the launch helper binary, resolved against the launcher dir.
pub const HELPER_BINARY: &str = "corral-launch";

/// Subcommand the helper runs to set up and exec the container command.
pub const HELPER_LAUNCH_COMMAND: &str = "launch";

// =============================================================================
// Reaper
// =============================================================================

/// Poll interval for liveness checks on processes we did not fork
/// ourselves (recovered after an engine restart, re-parented to init).
pub const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Environment variable pointing the container command at its sandbox.
pub const SANDBOX_ENV_VAR: &str = "MESOS_SANDBOX";
