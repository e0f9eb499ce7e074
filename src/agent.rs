//! Checkpointed agent state handed to `recover`.
//!
//! The agent checkpoints which executors it launched; after a restart it
//! hands that state to the containerizer, which reconciles it with the
//! runtime directory and any processes the launcher still knows about.

use crate::config::ExecutorSpec;
use crate::id::ContainerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One checkpointed executor run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    /// Pid checkpointed after the fork; absent if the agent died between
    /// forking and checkpointing.
    pub forked_pid: Option<i32>,
    /// The executor run (sandbox) directory.
    pub directory: PathBuf,
    /// Whether this run already completed; completed runs are skipped.
    #[serde(default)]
    pub completed: bool,
}

/// One checkpointed executor, with all of its runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorState {
    pub executor_id: String,
    /// Recovered executor descriptor; absent when its checkpoint was lost.
    pub info: Option<ExecutorSpec>,
    /// Container id of the latest run; only the latest run is recovered.
    pub latest: Option<ContainerId>,
    #[serde(default)]
    pub runs: HashMap<ContainerId, RunState>,
}

/// One checkpointed framework.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkState {
    pub framework_id: String,
    #[serde(default)]
    pub executors: Vec<ExecutorState>,
}

/// Checkpointed agent state, as recovered by the outer agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub slave_id: String,
    #[serde(default)]
    pub frameworks: Vec<FrameworkState>,
}

/// Snapshot of a single recovered container run, passed to the launcher
/// and the isolators during recovery.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub id: ContainerId,
    /// Absent for nested containers discovered without an executor.
    pub executor: Option<ExecutorSpec>,
    pub pid: i32,
    pub directory: PathBuf,
}
