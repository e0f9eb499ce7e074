//! Container state machine types and the in-memory container record.

use crate::config::{ContainerConfig, Resources};
use crate::id::ContainerId;
use crate::isolator::LaunchInfo;
use crate::provisioner::ProvisionInfo;
use crate::sync::{Pending, Promise};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

// =============================================================================
// State Machine
// =============================================================================

/// Lifecycle state of a container.
///
/// ```text
/// Provisioning ──► Preparing ──► Isolating ──► Fetching ──► Running
///       │              │             │             │           │
///       └──────────────┴─────────────┴─────────────┴───────────┴──► Destroying
/// ```
///
/// `Destroying` is terminal: a container enters it at most once and its
/// record is removed only after the full teardown sequence completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Provisioning,
    Preparing,
    Isolating,
    Fetching,
    Running,
    Destroying,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerState::Provisioning => "provisioning",
            ContainerState::Preparing => "preparing",
            ContainerState::Isolating => "isolating",
            ContainerState::Fetching => "fetching",
            ContainerState::Running => "running",
            ContainerState::Destroying => "destroying",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Limitations
// =============================================================================

/// Why an isolator reported a resource limitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitationReason {
    Cpu,
    Memory,
    Disk,
}

/// An asynchronous notification from an isolator that a resource bound
/// was violated. Observing one destroys the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limitation {
    pub message: String,
    pub reason: Option<LimitationReason>,
}

impl Limitation {
    #[must_use]
    pub fn new(message: impl Into<String>, reason: Option<LimitationReason>) -> Self {
        Self {
            message: message.into(),
            reason,
        }
    }
}

// =============================================================================
// Termination
// =============================================================================

/// Task state reported in a termination. The engine only ever reports
/// `Failed`, and only when limitations were observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Failed,
}

/// Final outcome record for a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerTermination {
    /// Raw wait status of the entry process, when known.
    pub status: Option<i32>,
    /// Set to `Failed` when resource limitations were observed.
    pub state: Option<TaskState>,
    /// Concatenated limitation messages.
    pub message: Option<String>,
    /// Reasons of the observed limitations.
    #[serde(default)]
    pub reasons: Vec<LimitationReason>,
}

// =============================================================================
// Table Record
// =============================================================================

/// Outcome of a settled pipeline step, shared between the launch and
/// destruction pipelines. Failures travel as messages: the launch future
/// wraps them into typed errors at the boundary.
pub(crate) type StepResult<T> = Result<T, String>;

/// In-memory record for one live container.
///
/// Owned by the containerizer's table; everything that must be observable
/// outside the table lock is a cloneable handle.
pub(crate) struct Container {
    pub state: ContainerState,
    pub config: ContainerConfig,
    /// Absolute sandbox path. Recovered containers may not know it.
    pub directory: Option<PathBuf>,
    /// Pid of the forked entry process, once known.
    pub pid: Option<i32>,
    /// Current resource allotment, mutable via `update`.
    pub resources: Resources,
    /// Settles when the provisioner resolves. Set only if an image was
    /// specified.
    pub provisioning: Option<Pending<StepResult<ProvisionInfo>>>,
    /// Settles with the ordered per-isolator launch contributions.
    pub launch_infos: Option<Pending<StepResult<Vec<Option<LaunchInfo>>>>>,
    /// Settles when the parallel isolate phase completes.
    pub isolation: Option<Pending<StepResult<()>>>,
    /// Settles with the entry process's wait status (`None` when the exit
    /// can never be observed).
    pub status: Option<Pending<Option<i32>>>,
    /// Limitations observed so far, append-only.
    pub limitations: Vec<Limitation>,
    /// Single-shot termination, resolved once on final teardown.
    pub termination: Promise<StepResult<ContainerTermination>>,
    /// Per-container FIFO used to serialize external `status` queries;
    /// tokio's mutex wakes waiters in acquisition order.
    pub sequence: Arc<tokio::sync::Mutex<()>>,
    /// Direct children, maintained bidirectionally with their parent ids.
    pub children: BTreeSet<ContainerId>,
    /// Limitation watchers and the reaped-exit callback; aborted when the
    /// record is dropped so they cannot outlive the container.
    pub watchers: Vec<JoinHandle<()>>,
}

impl Container {
    pub fn new(config: ContainerConfig) -> Self {
        let directory = Some(config.directory.clone());
        let resources = config.resources;
        Self {
            state: ContainerState::Provisioning,
            config,
            directory,
            pid: None,
            resources,
            provisioning: None,
            launch_infos: None,
            isolation: None,
            status: None,
            limitations: Vec::new(),
            termination: Promise::new(),
            sequence: Arc::new(tokio::sync::Mutex::new(())),
            children: BTreeSet::new(),
            watchers: Vec::new(),
        }
    }

    /// A record for a container recovered from checkpointed state.
    pub fn recovered(
        directory: Option<PathBuf>,
        pid: Option<i32>,
        status: Pending<Option<i32>>,
    ) -> Self {
        let mut container = Self::new(ContainerConfig::default());
        container.state = ContainerState::Running;
        container.directory = directory;
        container.pid = pid;
        container.status = Some(status);
        container
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}
