//! # corral
//!
//! **Node-Level Container Orchestration Engine**
//!
//! This crate is the orchestration core of a container runtime on a worker
//! node: one engine owning the lifecycle of a tree of containers
//! (top-level executors and nested sub-containers), coordinating a
//! pluggable pipeline of isolators, a launcher, a provisioner, a fetcher,
//! and a logger, and surviving restarts via checkpointed on-disk state.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Containerizer                           │
//! │   launch(id) → update/usage/status/wait(id) → destroy(id)       │
//! │                       recover(agent state)                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Launch pipeline (per container)                                │
//! │  provision ─► prepare ─► fork ─► isolate ─► fetch ─► exec       │
//! │                  │                  │                           │
//! │       sequential, declared order    parallel                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Pluggable collaborators                     │
//! │  ┌──────────┐ ┌──────────┐ ┌─────────────┐ ┌─────────┐ ┌──────┐ │
//! │  │ Isolator │ │ Launcher │ │ Provisioner │ │ Fetcher │ │Logger│ │
//! │  │  (many)  │ │  (fork)  │ │  (rootfs)   │ │  (URIs) │ │(stdio│ │
//! │  └──────────┘ └──────────┘ └─────────────┘ └─────────┘ └──────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//! Provisioning ──► Preparing ──► Isolating ──► Fetching ──► Running
//!       │              │             │             │           │
//!       └──────────────┴─────────────┴─────────────┴───────────┴──► Destroying
//! ```
//!
//! A destroy may arrive in any state; every pipeline stage re-validates
//! on resumption and fails with "destroyed during &lt;phase&gt;" while the
//! destroy walk converges the container to a terminal
//! [`ContainerTermination`]. The walk runs children first, kills processes
//! through the launcher before any isolator cleanup, cleans isolators in
//! reverse declared order, and finally destroys the provisioned rootfs.
//!
//! # Nesting
//!
//! Container ids form a tree: `ContainerId::child` derives a nested id
//! whose sandbox and runtime directories live underneath the root's. A
//! nested container leaves a checkpointed termination record behind; the
//! directories are removed when the root container goes away.
//!
//! # Recovery
//!
//! After an engine restart, [`Containerizer::recover`] reconciles the
//! checkpointed agent state with the runtime directory and with whatever
//! the launcher still knows, re-arms reapers and limitation watchers, and
//! destroys every container it cannot attribute (orphans).
//!
//! # Example
//!
//! ```rust,ignore
//! use corral::{Config, Containerizer, ContainerId, ExecutorLaunch};
//!
//! #[tokio::main]
//! async fn main() -> corral::Result<()> {
//!     let containerizer = Containerizer::builder(Config::default())
//!         .isolator_registry(registry)
//!         .launcher(launcher)
//!         .provisioner(provisioner)
//!         .fetcher(fetcher)
//!         .logger(logger)
//!         .build()?;
//!
//!     containerizer.recover(None).await?;
//!
//!     let id = ContainerId::new("executor-1");
//!     containerizer.launch(id.clone(), launch).await?;
//!
//!     let termination = containerizer.wait(&id).await?;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod constants;
mod container;
mod containerizer;
mod error;
mod reaper;
mod sync;

// =============================================================================
// Public Modules
// =============================================================================

/// Checkpointed agent state handed to recovery.
pub mod agent;

/// Engine flags and launch configuration types.
pub mod config;

/// Hierarchical container ids.
pub mod id;

/// The isolator contract and registry.
pub mod isolator;

/// The launcher contract.
pub mod launcher;

/// The container logger contract.
pub mod logger;

/// Engine metrics.
pub mod metrics;

/// The on-disk checkpoint layout.
pub mod paths;

/// The provisioner contract.
pub mod provisioner;

/// The fetcher contract.
pub mod fetcher;

// =============================================================================
// Re-exports
// =============================================================================

pub use crate::config::{
    CommandSpec, Config, ContainerConfig, ContainerDescriptor, ContainerKind, Environment,
    ExecutorLaunch, ExecutorSpec, Image, NestedLaunch, Resources, TaskSpec, Uri,
};
pub use crate::container::{
    ContainerState, ContainerTermination, Limitation, LimitationReason, TaskState,
};
pub use crate::containerizer::{Containerizer, ContainerizerBuilder, PostFetchHook};
pub use crate::error::{Error, Result};
pub use crate::id::ContainerId;
pub use crate::isolator::{
    CapabilitySet, ContainerStatus, Isolator, IsolatorRegistry, LaunchInfo, ResourceStatistics,
};
pub use crate::launcher::{LaunchFlags, Launcher};
pub use crate::logger::{ContainerLogger, IoSink, SubprocessIo};
pub use crate::metrics::Metrics;
pub use crate::provisioner::{ProvisionInfo, Provisioner};
pub use crate::fetcher::Fetcher;
pub use crate::agent::{AgentState, ContainerRun, ExecutorState, FrameworkState, RunState};
