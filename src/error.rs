//! Error types for the orchestration engine.

use crate::id::ContainerId;
use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Construction Errors
    // =========================================================================
    /// An isolator name in the isolation list is not registered.
    #[error("unknown isolator '{0}'")]
    UnknownIsolator(String),

    /// The same isolator appears twice in the isolation list.
    #[error("duplicate isolator '{0}'")]
    DuplicateIsolator(String),

    /// A required builder component was not supplied.
    #[error("containerizer misconfigured: {0}")]
    Misconfigured(String),

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    /// Container already present in the table.
    #[error("container {0} already started")]
    AlreadyStarted(ContainerId),

    /// Nested launch against a parent the table does not know.
    #[error("parent container {0} does not exist")]
    ParentNotFound(ContainerId),

    /// Nested launch against a parent that is being torn down.
    #[error("parent container {0} is being destroyed")]
    ParentDestroying(ContainerId),

    /// Operation against a container the table does not know.
    #[error("unknown container {0}")]
    UnknownContainer(ContainerId),

    /// A root container's sandbox is required but not recorded.
    #[error("unknown sandbox directory for root container {0}")]
    UnknownSandbox(ContainerId),

    // =========================================================================
    // Launch Pipeline Errors
    // =========================================================================
    /// A continuation resumed after the container was removed or entered
    /// `Destroying`; the destroy walk owns cleanup from here.
    #[error("container {id} destroyed during {phase}")]
    DestroyedDuringLaunch { id: ContainerId, phase: &'static str },

    /// The provisioner failed to materialize the rootfs.
    #[error("failed to provision container {id}: {reason}")]
    ProvisionFailed { id: ContainerId, reason: String },

    /// A provision result carried both Docker and Appc manifests.
    #[error("container {0} cannot have both docker and appc manifests")]
    ConflictingManifests(ContainerId),

    /// An isolator `prepare` failed.
    #[error("failed to prepare container {id}: {reason}")]
    PrepareFailed { id: ContainerId, reason: String },

    /// Isolator launch contributions could not be merged.
    #[error("conflicting launch contributions for container {id}: {reason}")]
    LaunchInfoConflict { id: ContainerId, reason: String },

    /// The logger could not prepare stdio sinks.
    #[error("failed to prepare container logger for {id}: {reason}")]
    LoggerFailed { id: ContainerId, reason: String },

    /// The launcher could not fork the container's entry process.
    #[error("failed to fork container {id}: {reason}")]
    ForkFailed { id: ContainerId, reason: String },

    /// A pid checkpoint could not be written.
    #[error("failed to checkpoint pid to '{path}': {reason}")]
    CheckpointFailed { path: PathBuf, reason: String },

    /// An isolator `isolate` failed.
    #[error("failed to isolate container {id}: {reason}")]
    IsolateFailed { id: ContainerId, reason: String },

    /// The fetcher failed to pull artifacts into the sandbox.
    #[error("failed to fetch artifacts for container {id}: {reason}")]
    FetchFailed { id: ContainerId, reason: String },

    /// The sync byte could not be delivered to the forked child.
    #[error("failed to synchronize child process of {id}: {reason}")]
    SyncFailed { id: ContainerId, reason: String },

    // =========================================================================
    // Destruction Errors
    // =========================================================================
    /// A destroy phase failed; the termination carries the details.
    #[error("failed to destroy container {id}: {reason}")]
    DestroyFailed { id: ContainerId, reason: String },

    // =========================================================================
    // Recovery Errors
    // =========================================================================
    /// Checkpointed state under the runtime dir could not be read back.
    #[error("failed to recover containerizer state: {0}")]
    RecoveryFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}
