//! The isolator contract, launch contributions, and the isolator registry.
//!
//! Isolators are the pluggable per-resource components of the engine. Each
//! one contributes to the launch of a container (`prepare`), attaches to
//! the forked process (`isolate`), observes limit violations (`watch`),
//! answers resource queries, and tears down its dimension (`cleanup`).

use crate::agent::ContainerRun;
use crate::config::{CommandSpec, Config, ContainerConfig, Environment, Resources};
use crate::container::Limitation;
use crate::error::{Error, Result};
use crate::id::ContainerId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

// =============================================================================
// Launch Contributions
// =============================================================================

/// Linux capabilities an isolator wants applied to the entry process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub capabilities: Vec<String>,
}

/// One isolator's contribution to a container launch, returned from
/// `prepare`. Contributions are merged in declared isolator order; see the
/// merge rules on each field.
#[derive(Debug, Clone)]
pub struct LaunchInfo {
    /// Overlaid onto the launch environment; later isolators override
    /// earlier ones (logged when it happens).
    pub environment: Environment,
    /// Merged field-wise across isolators; replaces the configured command
    /// when any isolator supplies one.
    pub command: Option<CommandSpec>,
    /// At most one isolator may set this; a second one fails the launch.
    pub working_directory: Option<PathBuf>,
    /// Run by the helper before exec, concatenated in isolator order.
    pub pre_exec_commands: Vec<CommandSpec>,
    /// Namespaces to unshare, OR-combined across isolators.
    pub namespaces: CloneFlags,
    /// At most one isolator may set this; a second one fails the launch.
    pub capabilities: Option<CapabilitySet>,
}

impl Default for LaunchInfo {
    fn default() -> Self {
        Self {
            environment: Environment::new(),
            command: None,
            working_directory: None,
            pre_exec_commands: Vec::new(),
            namespaces: CloneFlags::empty(),
            capabilities: None,
        }
    }
}

// =============================================================================
// Resource Queries
// =============================================================================

/// Point-in-time resource usage, merged across isolators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    pub timestamp: Option<DateTime<Utc>>,
    pub cpus_user_time_secs: Option<f64>,
    pub cpus_system_time_secs: Option<f64>,
    pub cpus_limit: Option<f64>,
    pub mem_rss_bytes: Option<u64>,
    pub mem_limit_bytes: Option<u64>,
    pub disk_used_bytes: Option<u64>,
}

impl ResourceStatistics {
    /// Overlays `other`'s set fields onto `self`.
    pub fn merge_from(&mut self, other: &ResourceStatistics) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(timestamp);
        take!(cpus_user_time_secs);
        take!(cpus_system_time_secs);
        take!(cpus_limit);
        take!(mem_rss_bytes);
        take!(mem_limit_bytes);
        take!(disk_used_bytes);
    }
}

/// Point-in-time container status, merged across isolators and the
/// launcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Pid of the entry process, contributed by the launcher.
    pub executor_pid: Option<i32>,
    /// Addresses assigned by network isolators.
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
}

impl ContainerStatus {
    /// Overlays `other` onto `self`; addresses are appended.
    pub fn merge_from(&mut self, other: &ContainerStatus) {
        if other.executor_pid.is_some() {
            self.executor_pid = other.executor_pid;
        }
        self.ip_addresses.extend(other.ip_addresses.iter().copied());
    }
}

// =============================================================================
// Isolator Contract
// =============================================================================

/// A pluggable component responsible for one resource or namespace
/// dimension of a container.
///
/// `prepare` calls are sequential in declared order (so a filesystem
/// isolator can run before the ones depending on it), `isolate` calls run
/// in parallel, and `cleanup` calls run sequentially in reverse declared
/// order. Isolators that do not support nesting are never invoked for
/// nested containers, in any phase.
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Registry name, e.g. `posix/cpu`.
    fn name(&self) -> &str;

    /// Whether this isolator participates in nested container phases.
    fn supports_nesting(&self) -> bool {
        false
    }

    /// Reconciles isolator-internal state with the recovered containers
    /// and the known orphans.
    async fn recover(
        &self,
        _states: &[ContainerRun],
        _orphans: &HashSet<ContainerId>,
    ) -> Result<()> {
        Ok(())
    }

    /// Contributes to the launch of a container. Runs before the fork.
    async fn prepare(
        &self,
        _id: &ContainerId,
        _config: &ContainerConfig,
    ) -> Result<Option<LaunchInfo>> {
        Ok(None)
    }

    /// Attaches this isolator's dimension to the forked process.
    async fn isolate(&self, _id: &ContainerId, _pid: i32) -> Result<()> {
        Ok(())
    }

    /// Resolves when the container violates a bound this isolator
    /// enforces. Resolves at most once per observed limitation; pending
    /// watches are dropped when the container goes away.
    async fn watch(&self, _id: &ContainerId) -> Result<Limitation> {
        std::future::pending().await
    }

    /// Applies a new resource allotment.
    async fn update(&self, _id: &ContainerId, _resources: &Resources) -> Result<()> {
        Ok(())
    }

    /// Current usage of this isolator's dimension.
    async fn usage(&self, _id: &ContainerId) -> Result<ResourceStatistics> {
        Ok(ResourceStatistics::default())
    }

    /// Current status of this isolator's dimension.
    async fn status(&self, _id: &ContainerId) -> Result<ContainerStatus> {
        Ok(ContainerStatus::default())
    }

    /// Tears down this isolator's dimension. Runs only after every process
    /// in the container has exited.
    async fn cleanup(&self, _id: &ContainerId) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Isolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Isolator").field(&self.name()).finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Factory producing an isolator from the engine configuration.
pub type IsolatorFactory = Box<dyn Fn(&Config) -> Result<Box<dyn Isolator>> + Send + Sync>;

/// Registry of isolator factories keyed by name.
///
/// The builder resolves the configured isolation list against this
/// registry; external modules plug in through the same interface.
#[derive(Default)]
pub struct IsolatorRegistry {
    factories: HashMap<String, IsolatorFactory>,
}

impl IsolatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`, replacing any previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Config) -> Result<Box<dyn Isolator>> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiates the isolator registered under `name`.
    pub fn create(&self, name: &str, config: &Config) -> Result<Box<dyn Isolator>> {
        match self.factories.get(name) {
            Some(factory) => factory(config),
            None => Err(Error::UnknownIsolator(name.to_string())),
        }
    }

    /// Resolves a comma-separated isolation list into an ordered isolator
    /// vector. Duplicate names are rejected; `filesystem/` isolators are
    /// moved to the front so later isolators can rely on the filesystem
    /// being in place.
    pub fn resolve(&self, config: &Config) -> Result<Vec<Box<dyn Isolator>>> {
        let mut seen = HashSet::new();
        let mut isolators: Vec<Box<dyn Isolator>> = Vec::new();

        for name in config
            .isolation
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            if !seen.insert(name.to_string()) {
                return Err(Error::DuplicateIsolator(name.to_string()));
            }

            let isolator = self.create(name, config)?;
            if name.starts_with("filesystem/") {
                isolators.insert(0, isolator);
            } else {
                isolators.push(isolator);
            }
        }

        Ok(isolators)
    }
}
