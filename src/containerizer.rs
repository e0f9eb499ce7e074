//! The orchestration engine.
//!
//! The containerizer owns the table of live containers and drives each one
//! through the launch pipeline (provision → prepare → fork → isolate →
//! fetch → exec), the destruction pipeline, and recovery after an engine
//! restart. Collaborators (isolators, launcher, provisioner, fetcher,
//! logger) are trait objects supplied at construction.
//!
//! # Concurrency
//!
//! The container table sits behind a mutex that is only ever held between
//! suspension points. Every pipeline stage re-validates on resumption that
//! its container is still in the table and not `Destroying`; a concurrent
//! destroy therefore makes in-flight launch stages fail with "destroyed
//! during <phase>" while the destroy walk drives the actual cleanup. Work
//! whose settlement both pipelines must observe (provisioning, prepare,
//! isolation, the reaper) runs on spawned tasks and settles a shared
//! [`Promise`](crate::sync::Promise) stored in the container record.

use crate::agent::{AgentState, ContainerRun};
use crate::config::{
    CommandSpec, Config, ContainerConfig, ContainerKind, Environment, ExecutorLaunch, Image,
    NestedLaunch, Resources,
};
use crate::constants::{HELPER_BINARY, HELPER_LAUNCH_COMMAND, SANDBOX_ENV_VAR};
use crate::container::{
    Container, ContainerState, ContainerTermination, Limitation, StepResult, TaskState,
};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::id::ContainerId;
use crate::isolator::{
    CapabilitySet, ContainerStatus, Isolator, IsolatorRegistry, LaunchInfo, ResourceStatistics,
};
use crate::launcher::{LaunchFlags, Launcher};
use crate::logger::ContainerLogger;
use crate::metrics::Metrics;
use crate::paths;
use crate::provisioner::{ProvisionInfo, Provisioner};
use crate::reaper;
use crate::sync::{Pending, Promise};
use chrono::Utc;
use nix::errno::Errno;
use nix::sched::CloneFlags;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Hook invoked after a successful fetch, with the container id and its
/// sandbox directory.
pub type PostFetchHook = Box<dyn Fn(&ContainerId, &Path) + Send + Sync>;

// =============================================================================
// Builder
// =============================================================================

/// Builder assembling a [`Containerizer`] from its collaborators.
pub struct ContainerizerBuilder {
    config: Config,
    registry: IsolatorRegistry,
    launcher: Option<Arc<dyn Launcher>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    logger: Option<Arc<dyn ContainerLogger>>,
    metrics_registry: prometheus::Registry,
    post_fetch_hook: Option<PostFetchHook>,
}

impl ContainerizerBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: IsolatorRegistry::new(),
            launcher: None,
            provisioner: None,
            fetcher: None,
            logger: None,
            metrics_registry: prometheus::Registry::new(),
            post_fetch_hook: None,
        }
    }

    /// Replaces the isolator registry the isolation list is resolved
    /// against.
    #[must_use]
    pub fn isolator_registry(mut self, registry: IsolatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    #[must_use]
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn ContainerLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Registers the engine's metrics on `registry` instead of a private
    /// one.
    #[must_use]
    pub fn metrics_registry(mut self, registry: prometheus::Registry) -> Self {
        self.metrics_registry = registry;
        self
    }

    /// Installs a hook that runs after every successful fetch.
    #[must_use]
    pub fn post_fetch_hook(
        mut self,
        hook: impl Fn(&ContainerId, &Path) + Send + Sync + 'static,
    ) -> Self {
        self.post_fetch_hook = Some(Box::new(hook));
        self
    }

    /// Validates the configuration, resolves the isolation list, and
    /// builds the engine.
    pub fn build(self) -> Result<Containerizer> {
        let names: HashSet<&str> = self
            .config
            .isolation
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();
        if names.contains("posix/disk") && names.contains("disk/du") {
            return Err(Error::Misconfigured(
                "both the legacy 'posix/disk' and the 'disk/du' isolators are enabled".to_string(),
            ));
        }

        let isolators: Vec<Arc<dyn Isolator>> = self
            .registry
            .resolve(&self.config)?
            .into_iter()
            .map(Arc::from)
            .collect();

        let launcher = self
            .launcher
            .ok_or_else(|| Error::Misconfigured("no launcher supplied".to_string()))?;
        let provisioner = self
            .provisioner
            .ok_or_else(|| Error::Misconfigured("no provisioner supplied".to_string()))?;
        let fetcher = self
            .fetcher
            .ok_or_else(|| Error::Misconfigured("no fetcher supplied".to_string()))?;
        let logger = self
            .logger
            .ok_or_else(|| Error::Misconfigured("no container logger supplied".to_string()))?;

        let metrics = Metrics::new(&self.metrics_registry)?;

        fs::create_dir_all(&self.config.runtime_dir)?;

        Ok(Containerizer {
            engine: Arc::new(Engine {
                config: self.config,
                isolators,
                launcher,
                provisioner,
                fetcher,
                logger,
                metrics,
                post_fetch_hook: self.post_fetch_hook,
                containers: Mutex::new(HashMap::new()),
            }),
        })
    }
}

// =============================================================================
// Public Handle
// =============================================================================

/// Handle onto the orchestration engine.
///
/// Cheap to clone; all clones share one container table.
#[derive(Clone)]
pub struct Containerizer {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for Containerizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Containerizer").finish_non_exhaustive()
    }
}

impl Containerizer {
    #[must_use]
    pub fn builder(config: Config) -> ContainerizerBuilder {
        ContainerizerBuilder::new(config)
    }

    /// Reconciles checkpointed state with live processes. Must complete
    /// before any launches are served.
    pub async fn recover(&self, state: Option<AgentState>) -> Result<()> {
        self.engine.recover(state).await
    }

    /// Launches a top-level container.
    ///
    /// Resolves to `false` when the container descriptor targets another
    /// containerizer.
    pub async fn launch(&self, id: ContainerId, launch: ExecutorLaunch) -> Result<bool> {
        self.engine.launch(id, launch).await
    }

    /// Launches a container nested under an existing, live parent.
    pub async fn launch_nested(&self, id: ContainerId, launch: NestedLaunch) -> Result<bool> {
        self.engine.launch_nested(id, launch).await
    }

    /// Applies a new resource allotment to a top-level container.
    /// Unknown or destroying containers are a warning, not an error.
    pub async fn update(&self, id: &ContainerId, resources: Resources) -> Result<()> {
        self.engine.update(id, resources).await
    }

    /// Aggregated resource usage; partial isolator failures are
    /// tolerated.
    pub async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics> {
        self.engine.usage(id).await
    }

    /// Aggregated container status, FIFO-serialized per container.
    pub async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        self.engine.status(id).await
    }

    /// Resolves with the container's termination once it is destroyed.
    /// For unknown nested ids the checkpointed termination is returned if
    /// present.
    pub async fn wait(&self, id: &ContainerId) -> Result<Option<ContainerTermination>> {
        self.engine.wait(id).await
    }

    /// Destroys a container and everything nested underneath it.
    /// Idempotent; `false` means the container was not known.
    pub async fn destroy(&self, id: &ContainerId) -> Result<bool> {
        self.engine.destroy(id).await
    }

    /// Ids of all live containers, including nested ones.
    pub async fn containers(&self) -> HashSet<ContainerId> {
        self.engine
            .table()
            .keys()
            .cloned()
            .collect()
    }

    /// The engine's metric counters.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.engine.metrics
    }
}

// =============================================================================
// Engine
// =============================================================================

struct Engine {
    config: Config,
    isolators: Vec<Arc<dyn Isolator>>,
    launcher: Arc<dyn Launcher>,
    provisioner: Arc<dyn Provisioner>,
    fetcher: Arc<dyn Fetcher>,
    logger: Arc<dyn ContainerLogger>,
    metrics: Metrics,
    post_fetch_hook: Option<PostFetchHook>,
    containers: Mutex<HashMap<ContainerId, Container>>,
}

impl Engine {
    /// The container table. A poisoned lock means a panic elsewhere; the
    /// table itself is still consistent because it is only mutated while
    /// the lock is held.
    fn table(&self) -> MutexGuard<'_, HashMap<ContainerId, Container>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Isolators applicable to `id`: nested containers skip isolators
    /// without nesting support.
    fn applicable_isolators(&self, id: &ContainerId) -> Vec<Arc<dyn Isolator>> {
        self.isolators
            .iter()
            .filter(|isolator| !id.is_nested() || isolator.supports_nesting())
            .cloned()
            .collect()
    }

    // =========================================================================
    // Launch
    // =========================================================================

    async fn launch(self: &Arc<Self>, id: ContainerId, launch: ExecutorLaunch) -> Result<bool> {
        if id.is_nested() {
            return Err(Error::Internal(
                "executor launches must use a top-level container id".to_string(),
            ));
        }

        if self.table().contains_key(&id) {
            return Err(Error::AlreadyStarted(id));
        }

        // Another containerizer's job.
        if let Some(task) = &launch.task {
            if task
                .container
                .as_ref()
                .is_some_and(|c| c.kind != ContainerKind::Mesos)
            {
                return Ok(false);
            }
        }

        let mut executor = launch.executor;
        if executor
            .container
            .as_ref()
            .is_some_and(|c| c.kind != ContainerKind::Mesos)
        {
            return Ok(false);
        }

        if executor.container.is_none() {
            executor.container = self.config.default_container.clone();
        }

        info!(
            container = %id,
            executor = %executor.executor_id,
            framework = %executor.framework_id,
            "Starting container"
        );

        let mut config = ContainerConfig {
            command: executor.command.clone(),
            directory: launch.directory,
            user: launch.user,
            resources: executor.resources,
            task: launch.task.clone(),
            executor: Some(executor.clone()),
            container: None,
            rootfs: None,
            docker_manifest: None,
            appc_manifest: None,
        };

        if let Some(task) = &launch.task {
            // Command task: the container descriptor rides on the task.
            if let Some(descriptor) = &task.container {
                config.container = Some(descriptor.clone());
                if descriptor.image.is_some() {
                    // The command executor must chroot into the task's
                    // rootfs, which takes root regardless of the task
                    // user.
                    config.command.user = Some("root".to_string());
                }
            }
        } else {
            config.container = executor.container.clone();
        }

        self.launch_container(id, config, launch.environment, &launch.slave_id, launch.checkpoint)
            .await
    }

    async fn launch_nested(self: &Arc<Self>, id: ContainerId, launch: NestedLaunch) -> Result<bool> {
        let Some(parent) = id.parent().cloned() else {
            return Err(Error::Internal(
                "nested launches require a container id with a parent".to_string(),
            ));
        };

        if launch
            .container
            .as_ref()
            .is_some_and(|c| c.kind != ContainerKind::Mesos)
        {
            return Ok(false);
        }

        let directory = {
            let table = self.table();

            if table.contains_key(&id) {
                return Err(Error::AlreadyStarted(id));
            }

            let Some(parent_container) = table.get(&parent) else {
                return Err(Error::ParentNotFound(parent));
            };
            if parent_container.state == ContainerState::Destroying {
                return Err(Error::ParentDestroying(parent));
            }

            let root = id.root();
            let root_directory = table
                .get(root)
                .and_then(|c| c.directory.clone())
                .ok_or_else(|| Error::UnknownSandbox(root.clone()))?;

            paths::sandbox_path(&root_directory, &id)
        };

        info!(container = %id, "Starting nested container");

        fs::create_dir_all(&directory)?;

        if let Some(user) = &launch.user {
            info!(directory = %directory.display(), user = %user, "Changing sandbox ownership");
            if let Err(e) = chown_to_user(&directory, user) {
                // Running as a user unknown on this node is diagnosed at
                // exec time; a failed chown only costs sandbox writes.
                warn!(
                    directory = %directory.display(),
                    user = %user,
                    error = %e,
                    "Failed to chown sandbox directory"
                );
            }
        }

        let config = ContainerConfig {
            command: launch.command,
            directory,
            user: launch.user,
            container: launch.container,
            ..ContainerConfig::default()
        };

        self.launch_container(id, config, Environment::new(), &launch.slave_id, false)
            .await
    }

    /// Shared tail of both launch flavors: runtime dir, table insertion,
    /// then the provisioning / prepare / fork / isolate / fetch / exec
    /// chain.
    async fn launch_container(
        self: &Arc<Self>,
        id: ContainerId,
        config: ContainerConfig,
        environment: Environment,
        slave_id: &str,
        checkpoint: bool,
    ) -> Result<bool> {
        let runtime = paths::runtime_path(&self.config.runtime_dir, &id);
        fs::create_dir_all(&runtime)?;

        let image = config.image().cloned();

        {
            let mut table = self.table();
            if table.contains_key(&id) {
                return Err(Error::AlreadyStarted(id));
            }
            if let Some(parent) = id.parent() {
                let Some(parent_container) = table.get_mut(parent) else {
                    return Err(Error::ParentNotFound(parent.clone()));
                };
                // Re-checked under the lock: a parent that began
                // destruction after the precondition check must not gain
                // children its destroy walk will never see.
                if parent_container.state == ContainerState::Destroying {
                    return Err(Error::ParentDestroying(parent.clone()));
                }
                parent_container.children.insert(id.clone());
            }
            table.insert(id.clone(), Container::new(config));
        }

        let provision_info = match image {
            Some(image) => Some(self.provision(&id, image).await?),
            None => None,
        };

        self.prepare(&id, provision_info).await?;
        self.start(&id, environment, slave_id, checkpoint).await
    }

    /// Runs the provisioner on a spawned task so a concurrent destroy can
    /// await its settlement through the record's pending handle.
    async fn provision(
        self: &Arc<Self>,
        id: &ContainerId,
        image: Image,
    ) -> Result<ProvisionInfo> {
        let promise: Promise<StepResult<ProvisionInfo>> = Promise::new();
        let pending = promise.pending();

        {
            let mut table = self.table();
            let Some(container) = table.get_mut(id) else {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "provisioning",
                });
            };
            if container.state == ContainerState::Destroying {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "provisioning",
                });
            }
            container.provisioning = Some(pending.clone());
        }

        let provisioner = Arc::clone(&self.provisioner);
        let task_id = id.clone();
        tokio::spawn(async move {
            let outcome = provisioner
                .provision(&task_id, &image)
                .await
                .map_err(|e| e.to_string());
            promise.set(outcome);
        });

        match pending.wait().await {
            Some(Ok(info)) => Ok(info),
            Some(Err(reason)) => Err(Error::ProvisionFailed {
                id: id.clone(),
                reason,
            }),
            None => Err(Error::ProvisionFailed {
                id: id.clone(),
                reason: "provisioning discarded".to_string(),
            }),
        }
    }

    /// Transitions to `Preparing` and runs every applicable isolator's
    /// `prepare` sequentially, in declared order.
    async fn prepare(
        self: &Arc<Self>,
        id: &ContainerId,
        provision_info: Option<ProvisionInfo>,
    ) -> Result<()> {
        let promise: Promise<StepResult<Vec<Option<LaunchInfo>>>> = Promise::new();
        let pending = promise.pending();

        let config = {
            let mut table = self.table();
            let Some(container) = table.get_mut(id) else {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "provisioning",
                });
            };
            if container.state == ContainerState::Destroying {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "provisioning",
                });
            }

            container.state = ContainerState::Preparing;

            if let Some(info) = provision_info {
                if info.docker_manifest.is_some() && info.appc_manifest.is_some() {
                    return Err(Error::ConflictingManifests(id.clone()));
                }
                container.config.rootfs = Some(info.rootfs);
                container.config.docker_manifest = info.docker_manifest;
                container.config.appc_manifest = info.appc_manifest;
            }

            container.launch_infos = Some(pending.clone());
            container.config.clone()
        };

        let isolators = self.applicable_isolators(id);
        let task_id = id.clone();
        tokio::spawn(async move {
            let mut infos = Vec::with_capacity(isolators.len());
            for isolator in isolators {
                match isolator.prepare(&task_id, &config).await {
                    Ok(info) => infos.push(info),
                    Err(e) => {
                        promise.set(Err(e.to_string()));
                        return;
                    }
                }
            }
            promise.set(Ok(infos));
        });

        match pending.wait().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(reason)) => Err(Error::PrepareFailed {
                id: id.clone(),
                reason,
            }),
            None => Err(Error::PrepareFailed {
                id: id.clone(),
                reason: "prepare discarded".to_string(),
            }),
        }
    }

    /// The post-prepare tail: merge contributions, obtain stdio sinks,
    /// fork, checkpoint the pid, register the reaper, isolate, fetch, and
    /// release the child.
    async fn start(
        self: &Arc<Self>,
        id: &ContainerId,
        mut environment: Environment,
        slave_id: &str,
        checkpoint: bool,
    ) -> Result<bool> {
        let destroyed = || Error::DestroyedDuringLaunch {
            id: id.clone(),
            phase: "preparing",
        };

        let (config, launch_infos) = {
            let table = self.table();
            let Some(container) = table.get(id) else {
                return Err(destroyed());
            };
            if container.state == ContainerState::Destroying {
                return Err(destroyed());
            }

            let launch_infos = container
                .launch_infos
                .as_ref()
                .and_then(Pending::try_get)
                .and_then(StepResult::ok)
                .ok_or_else(|| Error::Internal("prepare results missing".to_string()))?;

            (container.config.clone(), launch_infos)
        };

        // The command sees the sandbox at its in-container mount point
        // when a rootfs is used and at the host path otherwise.
        let sandbox = if config.rootfs.is_some() {
            self.config.sandbox_directory.clone()
        } else {
            config.directory.clone()
        };
        environment.insert(
            SANDBOX_ENV_VAR.to_string(),
            sandbox.to_string_lossy().into_owned(),
        );

        let merged = merge_launch_infos(
            id,
            &config,
            &self.config.sandbox_directory,
            environment,
            launch_infos,
        )?;

        let io = self
            .logger
            .prepare(config.executor.as_ref(), &config.directory)
            .await
            .map_err(|e| Error::LoggerFailed {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        {
            let table = self.table();
            match table.get(id) {
                Some(container) if container.state != ContainerState::Destroying => {}
                _ => return Err(destroyed()),
            }
        }

        // The child blocks reading this pipe until we write the sync byte
        // after isolation. Any early return below drops both ends, which
        // is what tells an already-forked child to give up.
        let (pipe_read, pipe_write) =
            nix::unistd::pipe().map_err(|e| Error::Internal(format!("failed to create pipe: {e}")))?;

        let runtime = paths::runtime_path(&self.config.runtime_dir, id);
        let flags = LaunchFlags {
            command: merged.command,
            working_directory: merged.working_directory,
            rootfs: merged.rootfs,
            user: config.user.clone(),
            pre_exec_commands: merged.pre_exec_commands,
            pipe_read: pipe_read.as_raw_fd(),
            pipe_write: pipe_write.as_raw_fd(),
            runtime_directory: runtime,
            capabilities: merged.capabilities,
        };

        let helper = self.config.launcher_dir.join(HELPER_BINARY);
        let argv = vec![
            HELPER_BINARY.to_string(),
            HELPER_LAUNCH_COMMAND.to_string(),
        ];

        debug!(container = %id, helper = %helper.display(), "Forking launch helper");

        let pid = self
            .launcher
            .fork(
                id,
                &helper,
                &argv,
                &io,
                &flags,
                &merged.environment,
                merged.namespaces,
            )
            .map_err(|e| Error::ForkFailed {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        let recorded = {
            let mut table = self.table();
            match table.get_mut(id) {
                Some(container) if container.state != ContainerState::Destroying => {
                    container.pid = Some(pid);
                    true
                }
                _ => false,
            }
        };
        if !recorded {
            // A destroy walk finished while we were forking; the fresh
            // child is ours to put down.
            let launcher = Arc::clone(&self.launcher);
            let stray = id.clone();
            tokio::spawn(async move {
                if let Err(e) = launcher.destroy(&stray).await {
                    warn!(container = %stray, error = %e, "Failed to destroy stray fork");
                }
            });
            return Err(destroyed());
        }

        // Agent-meta pid first, runtime pid second: a runtime pid without
        // a meta pid marks an orphan recovery may destroy.
        if checkpoint {
            if let Some(executor) = &config.executor {
                let path = paths::forked_pid_path(
                    &self.config.work_dir,
                    slave_id,
                    &executor.framework_id,
                    &executor.executor_id,
                    id,
                );
                info!(container = %id, pid, path = %path.display(), "Checkpointing forked pid");
                paths::checkpoint(&path, &pid.to_string()).map_err(|e| Error::CheckpointFailed {
                    path,
                    reason: e.to_string(),
                })?;
            }
        }

        paths::checkpoint_pid(&self.config.runtime_dir, id, pid).map_err(|e| {
            Error::CheckpointFailed {
                path: paths::runtime_path(&self.config.runtime_dir, id),
                reason: e.to_string(),
            }
        })?;

        let status = reaper::reap(&self.config.runtime_dir, id, pid);
        let reaped_handle = {
            let engine = Arc::clone(self);
            let reaped_id = id.clone();
            let reaped_status = status.clone();
            tokio::spawn(async move {
                let _ = reaped_status.wait().await;
                engine.reaped(&reaped_id).await;
            })
        };

        {
            let mut table = self.table();
            match table.get_mut(id) {
                Some(container) => {
                    container.status = Some(status);
                    container.watchers.push(reaped_handle);
                }
                None => {
                    reaped_handle.abort();
                    return Err(destroyed());
                }
            }
        }

        self.isolate(id, pid).await?;
        self.fetch(id, slave_id).await?;
        self.exec(id, pipe_write)?;
        drop(pipe_read);

        Ok(true)
    }

    /// Transitions to `Isolating`, registers limitation watchers, and
    /// runs every applicable isolator's `isolate` in parallel.
    async fn isolate(self: &Arc<Self>, id: &ContainerId, pid: i32) -> Result<()> {
        let promise: Promise<StepResult<()>> = Promise::new();
        let pending = promise.pending();

        {
            let mut table = self.table();
            let Some(container) = table.get_mut(id) else {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "preparing",
                });
            };
            if container.state == ContainerState::Destroying {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "preparing",
                });
            }
            container.state = ContainerState::Isolating;
            container.isolation = Some(pending.clone());
        }

        let isolators = self.applicable_isolators(id);

        let watcher_handles: Vec<_> = isolators
            .iter()
            .map(|isolator| self.spawn_watcher(Arc::clone(isolator), id.clone()))
            .collect();
        {
            let mut table = self.table();
            match table.get_mut(id) {
                Some(container) => container.watchers.extend(watcher_handles),
                None => {
                    for handle in watcher_handles {
                        handle.abort();
                    }
                }
            }
        }

        // Isolation is parallel: unlike prepare and cleanup there are no
        // ordering dependencies between isolators here.
        let task_id = id.clone();
        tokio::spawn(async move {
            let tasks: Vec<_> = isolators
                .into_iter()
                .map(|isolator| {
                    let id = task_id.clone();
                    tokio::spawn(async move { isolator.isolate(&id, pid).await })
                })
                .collect();

            let mut outcome: StepResult<()> = Ok(());
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if outcome.is_ok() {
                            outcome = Err(e.to_string());
                        }
                    }
                    Err(e) => {
                        if outcome.is_ok() {
                            outcome = Err(format!("isolate task failed: {e}"));
                        }
                    }
                }
            }
            promise.set(outcome);
        });

        match pending.wait().await {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(Error::IsolateFailed {
                id: id.clone(),
                reason,
            }),
            None => Err(Error::IsolateFailed {
                id: id.clone(),
                reason: "isolation discarded".to_string(),
            }),
        }
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        isolator: Arc<dyn Isolator>,
        id: ContainerId,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match isolator.watch(&id).await {
                Ok(limitation) => engine.limited(&id, limitation).await,
                Err(e) => {
                    warn!(container = %id, error = %e, "Error in a resource limitation watch");
                }
            }
        })
    }

    /// Transitions to `Fetching` and delegates artifact downloads.
    async fn fetch(self: &Arc<Self>, id: &ContainerId, slave_id: &str) -> Result<()> {
        let (command, directory, user) = {
            let mut table = self.table();
            let Some(container) = table.get_mut(id) else {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "isolating",
                });
            };
            if container.state == ContainerState::Destroying {
                return Err(Error::DestroyedDuringLaunch {
                    id: id.clone(),
                    phase: "isolating",
                });
            }
            container.state = ContainerState::Fetching;
            (
                container.config.command.clone(),
                container.config.directory.clone(),
                container.config.user.clone(),
            )
        };

        self.fetcher
            .fetch(id, &command, &directory, user.as_deref(), slave_id)
            .await
            .map_err(|e| Error::FetchFailed {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        if let Some(hook) = &self.post_fetch_hook {
            hook(id, &directory);
        }

        Ok(())
    }

    /// Releases the forked child by writing the sync byte, and
    /// transitions to `Running`.
    fn exec(&self, id: &ContainerId, pipe_write: OwnedFd) -> Result<()> {
        let mut table = self.table();
        let Some(container) = table.get_mut(id) else {
            return Err(Error::DestroyedDuringLaunch {
                id: id.clone(),
                phase: "fetching",
            });
        };
        if container.state == ContainerState::Destroying {
            return Err(Error::DestroyedDuringLaunch {
                id: id.clone(),
                phase: "fetching",
            });
        }

        let written = loop {
            match nix::unistd::write(&pipe_write, &[0u8]) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::SyncFailed {
                        id: id.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        };
        if written != 1 {
            return Err(Error::SyncFailed {
                id: id.clone(),
                reason: "short write".to_string(),
            });
        }

        container.state = ContainerState::Running;
        Ok(())
    }

    // =========================================================================
    // Destruction
    // =========================================================================

    /// Idempotent destroy. The first call per container flips it to
    /// `Destroying` and spawns the teardown walk; every call resolves with
    /// the shared termination.
    fn destroy(self: &Arc<Self>, id: &ContainerId) -> BoxFuture<Result<bool>> {
        let engine = Arc::clone(self);
        let id = id.clone();

        Box::pin(async move {
            let (termination, walk) = {
                let mut table = engine.table();
                let Some(container) = table.get_mut(&id) else {
                    // Redundant destroys race in from launch failures, the
                    // reaped executor, and the agent; later ones land here.
                    warn!(container = %id, "Attempted to destroy unknown container");
                    return Ok(false);
                };

                if container.state == ContainerState::Destroying {
                    (container.termination.pending(), None)
                } else {
                    info!(container = %id, state = %container.state, "Destroying container");
                    let previous = container.state;
                    container.state = ContainerState::Destroying;
                    let children: Vec<ContainerId> = container.children.iter().cloned().collect();
                    (container.termination.pending(), Some((previous, children)))
                }
            };

            if let Some((previous, children)) = walk {
                let walker = Arc::clone(&engine);
                let walk_id = id.clone();
                tokio::spawn(async move {
                    walker.destroy_sequence(walk_id, previous, children).await;
                });
            }

            match termination.wait().await {
                Some(Ok(_)) => Ok(true),
                Some(Err(reason)) => Err(Error::DestroyFailed { id, reason }),
                None => Err(Error::DestroyFailed {
                    id,
                    reason: "termination discarded".to_string(),
                }),
            }
        })
    }

    /// The teardown walk: children first, then a dispatch on the state
    /// the container was in when destruction began.
    async fn destroy_sequence(
        self: Arc<Self>,
        id: ContainerId,
        previous: ContainerState,
        children: Vec<ContainerId>,
    ) {
        let child_tasks: Vec<_> = children
            .into_iter()
            .map(|child| {
                let engine = Arc::clone(&self);
                tokio::spawn(async move { engine.destroy(&child).await })
            })
            .collect();

        let mut errors = Vec::new();
        for task in child_tasks {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => errors.push(e.to_string()),
                Err(_) => errors.push("discarded".to_string()),
            }
        }
        if !errors.is_empty() {
            self.fail_termination(
                &id,
                format!("Failed to destroy nested containers: {}", errors.join("; ")),
            );
            return;
        }

        match previous {
            ContainerState::Provisioning => {
                debug!(container = %id, "Waiting for provisioning to settle before destroying");

                let provisioning = self.table().get(&id).and_then(|c| c.provisioning.clone());
                if let Some(pending) = provisioning {
                    let _ = pending.wait().await;
                }

                // No isolator was prepared, so there is nothing to clean
                // up besides the rootfs.
                self.finish_destroy(&id).await;
            }
            ContainerState::Preparing => {
                debug!(container = %id, "Waiting for prepare to settle before destroying");

                // The launcher may already have forked. Entering
                // `Destroying` makes the pipeline drop the sync pipe, the
                // child terminates itself, and its status settles; only
                // then is it safe to clean up isolators. The launcher is
                // never asked to kill here.
                let (launch_infos, status) = {
                    let table = self.table();
                    let container = table.get(&id);
                    (
                        container.and_then(|c| c.launch_infos.clone()),
                        container.and_then(|c| c.status.clone()),
                    )
                };
                if let Some(pending) = launch_infos {
                    let _ = pending.wait().await;
                }
                if let Some(pending) = status {
                    let _ = pending.wait().await;
                }

                self.cleanup_isolators_and_finish(&id).await;
            }
            ContainerState::Isolating => {
                debug!(container = %id, "Waiting for isolation to settle before destroying");

                let isolation = self.table().get(&id).and_then(|c| c.isolation.clone());
                if let Some(pending) = isolation {
                    let _ = pending.wait().await;
                }

                self.kill_and_finish(&id).await;
            }
            ContainerState::Fetching => {
                self.fetcher.kill(&id);
                self.kill_and_finish(&id).await;
            }
            ContainerState::Running => {
                self.kill_and_finish(&id).await;
            }
            ContainerState::Destroying => {
                // The walk is only ever spawned by the transition into
                // `Destroying`.
                error!(container = %id, "Destroy walk dispatched twice");
            }
        }
    }

    /// Kills the container's processes, waits for the reaped status, then
    /// cleans up.
    async fn kill_and_finish(self: &Arc<Self>, id: &ContainerId) {
        if let Err(e) = self.launcher.destroy(id).await {
            // Isolators must not be cleaned up while processes may still
            // be alive, so teardown stops here.
            self.fail_termination(
                id,
                format!("Failed to kill all processes in the container: {e}"),
            );
            return;
        }

        let status = self.table().get(id).and_then(|c| c.status.clone());
        if let Some(pending) = status {
            let _ = pending.wait().await;
        }

        self.cleanup_isolators_and_finish(id).await;
    }

    /// Isolator cleanup in reverse declared order, sequentially; every
    /// result is collected before any failure is reported.
    async fn cleanup_isolators_and_finish(self: &Arc<Self>, id: &ContainerId) {
        let isolators = self.applicable_isolators(id);

        let mut errors = Vec::new();
        for isolator in isolators.iter().rev() {
            if let Err(e) = isolator.cleanup(id).await {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            self.fail_termination(
                id,
                format!(
                    "Failed to clean up an isolator when destroying container: {}",
                    errors.join("; ")
                ),
            );
            return;
        }

        self.finish_destroy(id).await;
    }

    /// Rootfs teardown, termination composition, runtime-dir cleanup, and
    /// removal from the table.
    async fn finish_destroy(self: &Arc<Self>, id: &ContainerId) {
        if let Err(e) = self.provisioner.destroy(id).await {
            self.fail_termination(
                id,
                format!("Failed to destroy the provisioned rootfs when destroying container: {e}"),
            );
            return;
        }

        let (promise, termination) = {
            let table = self.table();
            let Some(container) = table.get(id) else {
                error!(container = %id, "Container disappeared mid-destroy");
                return;
            };

            let mut termination = ContainerTermination::default();

            if let Some(Some(status)) = container.status.as_ref().and_then(Pending::try_get) {
                termination.status = Some(status);
            }

            // A limitation may race the exit it caused and never be
            // registered; when any were seen, the task failed.
            if !container.limitations.is_empty() {
                termination.state = Some(TaskState::Failed);
                termination.message = Some(
                    container
                        .limitations
                        .iter()
                        .map(|l| l.message.clone())
                        .collect::<Vec<_>>()
                        .join("; "),
                );
                termination.reasons = container
                    .limitations
                    .iter()
                    .filter_map(|l| l.reason)
                    .collect();
            }

            (container.termination.clone(), termination)
        };

        let runtime = paths::runtime_path(&self.config.runtime_dir, id);
        if id.is_nested() {
            // The nested runtime directory outlives the container so
            // `wait` keeps answering until the root goes away; only the
            // termination checkpoint marks it as done.
            info!(container = %id, "Checkpointing termination state of nested container");
            if let Err(e) = paths::write_termination(&self.config.runtime_dir, id, &termination) {
                error!(container = %id, error = %e, "Failed to checkpoint termination state");
            }
        } else if runtime.exists() {
            if let Err(e) = fs::remove_dir_all(&runtime) {
                warn!(container = %id, error = %e, "Failed to remove the runtime directory");
            }
        }

        {
            let mut table = self.table();
            if let Some(parent) = id.parent() {
                if let Some(parent_container) = table.get_mut(parent) {
                    parent_container.children.remove(id);
                }
            }
            table.remove(id);
        }

        promise.set(Ok(termination));
    }

    /// Fails the container's termination and counts the destroy error.
    fn fail_termination(&self, id: &ContainerId, reason: String) {
        error!(container = %id, reason = %reason, "Container destruction failed");

        let promise = self.table().get(id).map(|c| c.termination.clone());
        if let Some(promise) = promise {
            promise.set(Err(reason));
        }
        self.metrics.destroy_error();
    }

    // =========================================================================
    // Exit And Limitation Callbacks
    // =========================================================================

    /// Runs when the entry process has been reaped: the container is done.
    async fn reaped(self: &Arc<Self>, id: &ContainerId) {
        if !self.table().contains_key(id) {
            return;
        }
        info!(container = %id, "Container has exited");
        let _ = self.destroy(id).await;
    }

    /// Runs when an isolator reports a resource limitation.
    async fn limited(self: &Arc<Self>, id: &ContainerId, limitation: Limitation) {
        {
            let mut table = self.table();
            let Some(container) = table.get_mut(id) else {
                return;
            };
            if container.state == ContainerState::Destroying {
                return;
            }
            warn!(
                container = %id,
                message = %limitation.message,
                "Container limitation reached"
            );
            container.limitations.push(limitation);
        }
        let _ = self.destroy(id).await;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    async fn update(&self, id: &ContainerId, resources: Resources) -> Result<()> {
        if id.is_nested() {
            return Err(Error::Internal(
                "resource updates are only supported for top-level containers".to_string(),
            ));
        }

        {
            let mut table = self.table();
            match table.get_mut(id) {
                None => {
                    // The agent updates on terminal task state changes;
                    // the executor may already be gone.
                    warn!(container = %id, "Ignoring update for unknown container");
                    return Ok(());
                }
                Some(container) if container.state == ContainerState::Destroying => {
                    warn!(container = %id, "Ignoring update for container being destroyed");
                    return Ok(());
                }
                Some(container) => {
                    // Stored before isolators run so a subsequent update
                    // sees the new allotment.
                    container.resources = resources;
                }
            }
        }

        let tasks: Vec<_> = self
            .isolators
            .iter()
            .map(|isolator| {
                let isolator = Arc::clone(isolator);
                let id = id.clone();
                tokio::spawn(async move { isolator.update(&id, &resources).await })
            })
            .collect();

        for task in tasks {
            match task.await {
                Ok(result) => result?,
                Err(e) => return Err(Error::Internal(format!("update task failed: {e}"))),
            }
        }
        Ok(())
    }

    async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics> {
        let resources = {
            let table = self.table();
            table
                .get(id)
                .map(|c| c.resources)
                .ok_or_else(|| Error::UnknownContainer(id.clone()))?
        };

        let tasks: Vec<_> = self
            .isolators
            .iter()
            .map(|isolator| {
                let isolator = Arc::clone(isolator);
                let id = id.clone();
                tokio::spawn(async move { isolator.usage(&id).await })
            })
            .collect();

        let mut result = ResourceStatistics::default();
        for task in tasks {
            match task.await {
                Ok(Ok(statistics)) => result.merge_from(&statistics),
                Ok(Err(e)) => {
                    warn!(container = %id, error = %e, "Skipping resource statistic");
                }
                Err(e) => {
                    warn!(container = %id, error = %e, "Skipping resource statistic");
                }
            }
        }

        result.timestamp = Some(Utc::now());
        // Limits come from the stored allotment; isolators only report
        // usage.
        if let Some(cpus) = resources.cpus {
            result.cpus_limit = Some(cpus);
        }
        if let Some(mem) = resources.mem_bytes {
            result.mem_limit_bytes = Some(mem);
        }

        Ok(result)
    }

    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let sequence = {
            let table = self.table();
            table
                .get(id)
                .map(|c| Arc::clone(&c.sequence))
                .ok_or_else(|| Error::UnknownContainer(id.clone()))?
        };

        debug!(container = %id, "Serializing status request");

        // The per-container mutex is fair, so successive agent requests
        // complete in issue order.
        let _ordering = sequence.lock().await;

        let mut tasks: Vec<_> = self
            .applicable_isolators(id)
            .into_iter()
            .map(|isolator| {
                let id = id.clone();
                tokio::spawn(async move { isolator.status(&id).await })
            })
            .collect();
        {
            let launcher = Arc::clone(&self.launcher);
            let id = id.clone();
            tasks.push(tokio::spawn(async move { launcher.status(&id).await }));
        }

        let mut result = ContainerStatus::default();
        for task in tasks {
            match task.await {
                Ok(Ok(status)) => result.merge_from(&status),
                Ok(Err(e)) => {
                    warn!(container = %id, error = %e, "Skipping status");
                }
                Err(e) => {
                    warn!(container = %id, error = %e, "Skipping status");
                }
            }
        }

        Ok(result)
    }

    async fn wait(&self, id: &ContainerId) -> Result<Option<ContainerTermination>> {
        let pending = self.table().get(id).map(|c| c.termination.pending());

        match pending {
            Some(pending) => match pending.wait().await {
                Some(Ok(termination)) => Ok(Some(termination)),
                Some(Err(reason)) => Err(Error::DestroyFailed {
                    id: id.clone(),
                    reason,
                }),
                None => Err(Error::DestroyFailed {
                    id: id.clone(),
                    reason: "termination discarded".to_string(),
                }),
            },
            None => {
                // A nested container may be done but checkpointed.
                if id.is_nested() {
                    if let Some(termination) =
                        paths::read_termination(&self.config.runtime_dir, id)?
                    {
                        return Ok(Some(termination));
                    }
                }
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    async fn recover(self: &Arc<Self>, state: Option<AgentState>) -> Result<()> {
        info!("Recovering containerizer");

        let mut recoverable: Vec<ContainerRun> = Vec::new();
        if let Some(state) = &state {
            for framework in &state.frameworks {
                for executor in &framework.executors {
                    let Some(info) = &executor.info else {
                        warn!(
                            executor = %executor.executor_id,
                            framework = %framework.framework_id,
                            "Skipping recovery of executor: info could not be recovered"
                        );
                        continue;
                    };
                    let Some(latest) = &executor.latest else {
                        warn!(
                            executor = %executor.executor_id,
                            framework = %framework.framework_id,
                            "Skipping recovery of executor: latest run could not be recovered"
                        );
                        continue;
                    };
                    let Some(run) = executor.runs.get(latest) else {
                        warn!(
                            executor = %executor.executor_id,
                            framework = %framework.framework_id,
                            "Skipping recovery of executor: latest run state is missing"
                        );
                        continue;
                    };

                    // Without a pid the reaper has nothing to monitor; the
                    // agent's wait on the container cleans it up instead.
                    let Some(pid) = run.forked_pid else {
                        continue;
                    };
                    if run.completed {
                        debug!(
                            executor = %executor.executor_id,
                            container = %latest,
                            "Skipping recovery of completed run"
                        );
                        continue;
                    }
                    if info
                        .container
                        .as_ref()
                        .is_some_and(|c| c.kind != ContainerKind::Mesos)
                    {
                        info!(
                            executor = %executor.executor_id,
                            "Skipping recovery of executor launched by another containerizer"
                        );
                        continue;
                    }
                    if !run.directory.exists() {
                        warn!(
                            executor = %executor.executor_id,
                            directory = %run.directory.display(),
                            "Skipping recovery of executor: run directory is gone"
                        );
                        continue;
                    }

                    info!(
                        container = %latest,
                        executor = %executor.executor_id,
                        framework = %framework.framework_id,
                        "Recovering container"
                    );

                    recoverable.push(ContainerRun {
                        id: latest.clone(),
                        executor: Some(info.clone()),
                        pid,
                        directory: run.directory.clone(),
                    });
                }
            }
        }

        // Seed the table from the agent state. Checkpointed pids imply
        // the container launched successfully, so it is running until the
        // reaper says otherwise.
        let mut alive: HashSet<ContainerId> = HashSet::new();
        for run in &recoverable {
            alive.insert(run.id.clone());
            let status = reaper::reap(&self.config.runtime_dir, &run.id, run.pid);
            let container =
                Container::recovered(Some(run.directory.clone()), Some(run.pid), status);
            self.table().insert(run.id.clone(), container);
        }

        // Reconcile the runtime directory with the agent state; anything
        // unaccounted for is an orphan candidate.
        let mut orphans: HashSet<ContainerId> = HashSet::new();
        for id in paths::container_ids(&self.config.runtime_dir)? {
            if alive.contains(&id) {
                continue;
            }

            // A checkpointed termination means a nested container already
            // destroyed before the restart; its directory lives on with
            // the root.
            if paths::termination_exists(&self.config.runtime_dir, &id) {
                continue;
            }

            let pid = paths::read_pid(&self.config.runtime_dir, &id)?;

            let directory = if id.is_nested() {
                let root = id.root();
                let root_directory = self
                    .table()
                    .get(root)
                    .ok_or_else(|| {
                        Error::RecoveryFailed(format!(
                            "nested container {id} recovered before its root"
                        ))
                    })?
                    .directory
                    .clone();
                root_directory.map(|d| paths::sandbox_path(&d, &id))
            } else {
                None
            };

            // A pid may be unknown if the engine died between fork and
            // checkpoint; the sync pipe closed with the engine, so the
            // child exits on its own and there is no exit to observe.
            let status = match pid {
                Some(pid) => reaper::reap(&self.config.runtime_dir, &id, pid),
                None => Promise::settled(None).pending(),
            };

            self.table().insert(
                id.clone(),
                Container::recovered(directory.clone(), pid, status),
            );

            if let (Some(pid), Some(directory)) = (pid, directory.as_ref()) {
                if id.is_nested() && alive.contains(id.root()) {
                    recoverable.push(ContainerRun {
                        id: id.clone(),
                        executor: None,
                        pid,
                        directory: directory.clone(),
                    });
                    continue;
                }
            }

            orphans.insert(id);
        }

        // The launcher may know processes the table does not.
        for id in self.launcher.recover(&recoverable).await? {
            if orphans.contains(&id) || self.table().contains_key(&id) {
                continue;
            }
            self.table().insert(
                id.clone(),
                Container::recovered(None, None, Promise::settled(None).pending()),
            );
            orphans.insert(id);
        }

        // Isolators next, then the provisioner, so rootfs garbage
        // collection sees every container the isolators still know.
        for isolator in &self.isolators {
            if isolator.supports_nesting() {
                isolator.recover(&recoverable, &orphans).await?;
            } else {
                let top_level_runs: Vec<ContainerRun> = recoverable
                    .iter()
                    .filter(|run| !run.id.is_nested())
                    .cloned()
                    .collect();
                let top_level_orphans: HashSet<ContainerId> = orphans
                    .iter()
                    .filter(|id| !id.is_nested())
                    .cloned()
                    .collect();
                isolator.recover(&top_level_runs, &top_level_orphans).await?;
            }
        }

        let known: HashSet<ContainerId> = orphans
            .iter()
            .cloned()
            .chain(recoverable.iter().map(|run| run.id.clone()))
            .collect();
        self.provisioner.recover(&known).await?;

        // Re-arm limitation watchers and re-attach recovered executors to
        // the logger.
        for run in &recoverable {
            let watcher_handles: Vec<_> = self
                .applicable_isolators(&run.id)
                .into_iter()
                .map(|isolator| self.spawn_watcher(isolator, run.id.clone()))
                .collect();
            {
                let mut table = self.table();
                if let Some(container) = table.get_mut(&run.id) {
                    container.watchers.extend(watcher_handles);
                }
            }

            if !run.id.is_nested() {
                if let Some(executor) = &run.executor {
                    if let Err(e) = self.logger.recover(executor, &run.directory).await {
                        warn!(
                            executor = %executor.executor_id,
                            error = %e,
                            "Container logger failed to recover executor"
                        );
                    }
                }
            }
        }

        // Rebuild the tree, then register exit callbacks: destroy relies
        // on the children sets, so they must be complete first.
        {
            let mut table = self.table();
            let ids: Vec<ContainerId> = table.keys().cloned().collect();
            for id in &ids {
                if let Some(parent) = id.parent() {
                    if let Some(parent_container) = table.get_mut(parent) {
                        parent_container.children.insert(id.clone());
                    }
                }
            }
        }
        let statuses: Vec<(ContainerId, Pending<Option<i32>>)> = self
            .table()
            .iter()
            .filter_map(|(id, c)| c.status.clone().map(|s| (id.clone(), s)))
            .collect();
        for (id, status) in statuses {
            let engine = Arc::clone(self);
            let callback_id = id.clone();
            let handle = tokio::spawn(async move {
                let _ = status.wait().await;
                engine.reaped(&callback_id).await;
            });
            // Registered on the record so the callback dies with the
            // container.
            match self.table().get_mut(&id) {
                Some(container) => container.watchers.push(handle),
                None => handle.abort(),
            }
        }

        // Orphans go through the regular destruction pipeline,
        // fire-and-forget.
        for id in orphans {
            info!(container = %id, "Cleaning up orphan container");
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = engine.destroy(&id).await {
                    warn!(container = %id, error = %e, "Failed to destroy orphan container");
                }
            });
        }

        Ok(())
    }
}

// =============================================================================
// Launch Info Merging
// =============================================================================

/// The merged product of all isolator launch contributions.
struct MergedLaunch {
    command: CommandSpec,
    environment: Environment,
    working_directory: PathBuf,
    pre_exec_commands: Vec<CommandSpec>,
    namespaces: CloneFlags,
    capabilities: Option<CapabilitySet>,
    rootfs: Option<PathBuf>,
}

fn merge_launch_infos(
    id: &ContainerId,
    config: &ContainerConfig,
    sandbox_directory: &Path,
    mut environment: Environment,
    infos: Vec<Option<LaunchInfo>>,
) -> Result<MergedLaunch> {
    // A command task's executor itself stays on the host filesystem even
    // when the task has a rootfs.
    let rootfs = if config.is_command_task() {
        None
    } else {
        config.rootfs.clone()
    };

    let mut launch_command: Option<CommandSpec> = None;
    let mut working_directory: Option<PathBuf> = None;
    let mut pre_exec_commands = Vec::new();
    let mut namespaces = CloneFlags::empty();
    let mut capabilities: Option<CapabilitySet> = None;

    for info in infos.into_iter().flatten() {
        for (name, value) in info.environment {
            if let Some(previous) = environment.get(&name) {
                debug!(
                    container = %id,
                    variable = %name,
                    previous = %previous,
                    new = %value,
                    "Overwriting environment variable"
                );
            }
            environment.insert(name, value);
        }

        if let Some(command) = info.command {
            match &mut launch_command {
                Some(existing) => {
                    // Isolators bear the burden of the merged command
                    // being valid.
                    debug!(container = %id, "Merging launch commands from two isolators");
                    existing.merge_from(&command);
                }
                None => launch_command = Some(command),
            }
        }

        if let Some(directory) = info.working_directory {
            if working_directory.is_some() {
                return Err(Error::LaunchInfoConflict {
                    id: id.clone(),
                    reason: "at most one working directory can be returned from isolators"
                        .to_string(),
                });
            }
            working_directory = Some(directory);
        }

        pre_exec_commands.extend(info.pre_exec_commands);
        namespaces |= info.namespaces;

        if let Some(caps) = info.capabilities {
            if capabilities.is_some() {
                return Err(Error::LaunchInfoConflict {
                    id: id.clone(),
                    reason: "at most one capabilities set can be returned from isolators"
                        .to_string(),
                });
            }
            capabilities = Some(caps);
        }
    }

    let mut command = launch_command.unwrap_or_else(|| config.command.clone());

    // Old-style command tasks find their rootfs through an argument.
    if config.is_command_task() {
        if let Some(task_rootfs) = &config.rootfs {
            command
                .arguments
                .push(format!("--rootfs={}", task_rootfs.display()));
        }
    }

    // These belong to the outer config, not the exec'd command.
    command.uris.clear();
    command.environment.clear();
    command.user = None;

    for (name, value) in &config.command.environment {
        if let Some(previous) = environment.get(name) {
            debug!(
                container = %id,
                variable = %name,
                previous = %previous,
                new = %value,
                "Overwriting environment variable"
            );
        }
        environment.insert(name.clone(), value.clone());
    }

    let working_directory = if rootfs.is_none() {
        // On the host filesystem an arbitrary cwd is a security hole.
        if let Some(directory) = &working_directory {
            warn!(
                container = %id,
                directory = %directory.display(),
                "Ignoring working directory from launch info: executor uses the host filesystem"
            );
        }
        config.directory.clone()
    } else {
        working_directory.unwrap_or_else(|| sandbox_directory.to_path_buf())
    };

    Ok(MergedLaunch {
        command,
        environment,
        working_directory,
        pre_exec_commands,
        namespaces,
        capabilities,
        rootfs,
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn chown_to_user(directory: &Path, user: &str) -> Result<()> {
    let resolved = nix::unistd::User::from_name(user)
        .map_err(|e| Error::Internal(format!("failed to look up user '{user}': {e}")))?
        .ok_or_else(|| Error::Internal(format!("user '{user}' does not exist")))?;
    nix::unistd::chown(directory, Some(resolved.uid), Some(resolved.gid))
        .map_err(|e| Error::Internal(format!("chown failed: {e}")))?;
    Ok(())
}
