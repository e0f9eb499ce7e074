//! The launcher contract.
//!
//! The launcher owns the native side of process creation: forking the
//! launch helper with the requested namespaces, tracking the process
//! groups (or cgroup) of each container, and killing everything a
//! container ever spawned when asked to destroy it.

use crate::agent::ContainerRun;
use crate::config::{CommandSpec, Environment};
use crate::error::Result;
use crate::id::ContainerId;
use crate::isolator::{CapabilitySet, ContainerStatus};
use crate::logger::SubprocessIo;
use async_trait::async_trait;
use nix::sched::CloneFlags;
use std::collections::HashSet;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// Flags handed to the launch helper binary.
///
/// The helper blocks reading `pipe_read` until the engine writes the sync
/// byte post-isolation, then runs the pre-exec commands and execs the
/// command. It checkpoints the command's wait status into
/// `runtime_directory` when the command exits.
#[derive(Debug, Clone)]
pub struct LaunchFlags {
    pub command: CommandSpec,
    pub working_directory: PathBuf,
    /// Provisioned root filesystem to pivot into, if any.
    pub rootfs: Option<PathBuf>,
    pub user: Option<String>,
    pub pre_exec_commands: Vec<CommandSpec>,
    /// Read end of the sync pipe, inherited by the child.
    pub pipe_read: RawFd,
    /// Write end of the sync pipe; the child closes it immediately.
    pub pipe_write: RawFd,
    pub runtime_directory: PathBuf,
    pub capabilities: Option<CapabilitySet>,
}

/// The component that forks container entry processes and dismantles
/// whatever process tree they grow.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Reconciles launcher-internal state with the recovered runs.
    /// Returns ids the launcher knows about that the engine does not;
    /// those become orphans.
    async fn recover(&self, states: &[ContainerRun]) -> Result<HashSet<ContainerId>>;

    /// Forks the launch helper for `id` and returns its pid.
    ///
    /// Synchronous: the fork either happens or fails before control
    /// returns, so the engine can record the pid without a suspension in
    /// between.
    fn fork(
        &self,
        id: &ContainerId,
        helper: &Path,
        argv: &[String],
        io: &SubprocessIo,
        flags: &LaunchFlags,
        environment: &Environment,
        namespaces: CloneFlags,
    ) -> Result<i32>;

    /// Launcher's view of the container, merged into `status` results.
    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus>;

    /// Kills every process in the container. Isolator cleanup only runs
    /// after this succeeds.
    async fn destroy(&self, id: &ContainerId) -> Result<()>;
}
