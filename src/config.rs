//! Engine configuration and launch configuration snapshots.
//!
//! `Config` is the engine's flag set; the remaining types describe what to
//! launch. `ContainerConfig` is the per-container snapshot the pipeline
//! carries: it is assembled at launch time and enriched once provisioning
//! resolves (rootfs, image manifest).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// =============================================================================
// Engine Flags
// =============================================================================

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent work dir; the meta checkpoint tree lives underneath.
    pub work_dir: PathBuf,

    /// Engine-private checkpoint area (`containers/<id>/...`).
    pub runtime_dir: PathBuf,

    /// Directory holding the launch helper binary.
    pub launcher_dir: PathBuf,

    /// In-container sandbox mount point, used when a rootfs is provisioned.
    pub sandbox_directory: PathBuf,

    /// Comma-separated, ordered isolator names.
    pub isolation: String,

    /// Applied to executors that do not carry a container descriptor.
    pub default_container: Option<ContainerDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/corral"),
            runtime_dir: PathBuf::from("/var/run/corral"),
            launcher_dir: PathBuf::from("/usr/libexec/corral"),
            sandbox_directory: PathBuf::from("/mnt/sandbox"),
            isolation: "posix/cpu,posix/mem".to_string(),
            default_container: None,
        }
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Ordered name → value environment map.
pub type Environment = BTreeMap<String, String>;

// =============================================================================
// Command
// =============================================================================

/// An artifact to place into the sandbox before the command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uri {
    pub value: String,
    /// Whether the fetcher should mark the artifact executable.
    #[serde(default)]
    pub executable: bool,
    /// Whether the fetcher should extract archives.
    #[serde(default)]
    pub extract: bool,
}

/// What to execute inside the container.
///
/// Mirrors the wire-level command descriptor: either a shell line in
/// `value`, or `value` as argv\[0\] with `arguments` when `shell` is false.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub value: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Defaults to running through a shell when unset.
    pub shell: Option<bool>,
    #[serde(default)]
    pub uris: Vec<Uri>,
    #[serde(default)]
    pub environment: Environment,
    pub user: Option<String>,
}

impl CommandSpec {
    /// Shell command constructor.
    #[must_use]
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            shell: Some(true),
            ..Self::default()
        }
    }

    /// Field-wise merge: scalar fields are overwritten when the other side
    /// sets them, repeated fields are appended, environments are overlaid.
    /// Isolators contributing command fragments bear the burden of the
    /// merged command making sense.
    pub fn merge_from(&mut self, other: &CommandSpec) {
        if other.value.is_some() {
            self.value.clone_from(&other.value);
        }
        if other.shell.is_some() {
            self.shell = other.shell;
        }
        if other.user.is_some() {
            self.user.clone_from(&other.user);
        }
        self.arguments.extend(other.arguments.iter().cloned());
        self.uris.extend(other.uris.iter().cloned());
        for (name, value) in &other.environment {
            self.environment.insert(name.clone(), value.clone());
        }
    }
}

// =============================================================================
// Images And Container Descriptors
// =============================================================================

/// A container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Image {
    Docker { name: String },
    Appc { name: String },
}

/// Which containerizer a descriptor targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Handled by this engine.
    Mesos,
    /// Delegated to another containerizer; `launch` resolves to `false`.
    Docker,
}

/// Container portion of a task or executor descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub kind: ContainerKind,
    pub image: Option<Image>,
}

impl ContainerDescriptor {
    /// A Mesos-type descriptor with no image.
    #[must_use]
    pub fn mesos() -> Self {
        Self {
            kind: ContainerKind::Mesos,
            image: None,
        }
    }

    /// A Mesos-type descriptor with an image.
    #[must_use]
    pub fn with_image(image: Image) -> Self {
        Self {
            kind: ContainerKind::Mesos,
            image: Some(image),
        }
    }
}

// =============================================================================
// Executors And Tasks
// =============================================================================

/// Executor descriptor checkpointed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub executor_id: String,
    pub framework_id: String,
    pub command: CommandSpec,
    #[serde(default)]
    pub resources: Resources,
    pub container: Option<ContainerDescriptor>,
}

/// Task descriptor for the command-task case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub container: Option<ContainerDescriptor>,
}

// =============================================================================
// Resources
// =============================================================================

/// Resource allotment for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: Option<f64>,
    pub mem_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

// =============================================================================
// Per-Container Launch Snapshot
// =============================================================================

/// Snapshot of everything the pipeline needs to launch one container.
///
/// `rootfs` and the manifest are absent until provisioning resolves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub command: CommandSpec,
    pub directory: PathBuf,
    pub user: Option<String>,
    pub executor: Option<ExecutorSpec>,
    pub task: Option<TaskSpec>,
    pub container: Option<ContainerDescriptor>,
    #[serde(default)]
    pub resources: Resources,
    pub rootfs: Option<PathBuf>,
    pub docker_manifest: Option<serde_json::Value>,
    pub appc_manifest: Option<serde_json::Value>,
}

impl ContainerConfig {
    /// Whether the descriptor asks for an image-provisioned rootfs.
    #[must_use]
    pub fn image(&self) -> Option<&Image> {
        self.container.as_ref().and_then(|c| c.image.as_ref())
    }

    /// Whether this is a command task (task riding the default executor).
    #[must_use]
    pub fn is_command_task(&self) -> bool {
        self.task.is_some()
    }
}

// =============================================================================
// Launch Requests
// =============================================================================

/// Parameters of a top-level launch.
#[derive(Debug, Clone)]
pub struct ExecutorLaunch {
    pub task: Option<TaskSpec>,
    pub executor: ExecutorSpec,
    pub directory: PathBuf,
    pub user: Option<String>,
    pub slave_id: String,
    pub environment: Environment,
    /// Whether the agent asked for the forked pid to be checkpointed to
    /// its meta directory.
    pub checkpoint: bool,
}

/// Parameters of a nested launch; the parent must already be running.
#[derive(Debug, Clone)]
pub struct NestedLaunch {
    pub command: CommandSpec,
    pub container: Option<ContainerDescriptor>,
    pub user: Option<String>,
    pub slave_id: String,
}
