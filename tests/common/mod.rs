//! Shared test fixtures: recording mock collaborators and a containerizer
//! assembled from them.
//!
//! The launcher forks real `sleep` processes so the reaper, the sync
//! pipe, and signal-based teardown behave like production; everything
//! else records what the engine asked of it.

#![allow(dead_code)]

use async_trait::async_trait;
use corral::{
    agent::ContainerRun,
    CommandSpec, Config, ContainerId, ContainerLogger, ContainerStatus, Containerizer,
    Environment, Error, ExecutorLaunch, ExecutorSpec, Fetcher, Image, Isolator, IsolatorRegistry,
    LaunchFlags, LaunchInfo, Launcher, Limitation, NestedLaunch, ProvisionInfo, Provisioner,
    ResourceStatistics, Resources, SubprocessIo,
};
use nix::sched::CloneFlags;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Event Recording
// =============================================================================

/// Append-only log of what the engine asked the collaborators to do.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }

    /// Events matching `prefix`, in recording order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Gate
// =============================================================================

/// A point a mock blocks at until the test releases it.
#[derive(Clone)]
pub struct Gate {
    entered_tx: Arc<watch::Sender<bool>>,
    release_tx: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (entered_tx, _) = watch::channel(false);
        let (release_tx, _) = watch::channel(false);
        Self {
            entered_tx: Arc::new(entered_tx),
            release_tx: Arc::new(release_tx),
        }
    }

    /// Called by the mock: marks the gate entered, then blocks until
    /// released.
    pub async fn pass(&self) {
        self.entered_tx.send_replace(true);
        let mut rx = self.release_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Called by the test: waits until the mock reached the gate.
    pub async fn entered(&self) {
        let mut rx = self.entered_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn release(&self) {
        self.release_tx.send_replace(true);
    }
}

// =============================================================================
// Isolator
// =============================================================================

/// Recording isolator with optional gates and a limitation trigger.
#[derive(Clone)]
pub struct TestIsolator {
    name: String,
    nesting: bool,
    events: Events,
    launch_info: Arc<Mutex<Option<LaunchInfo>>>,
    usage: Arc<Mutex<ResourceStatistics>>,
    status: Arc<Mutex<ContainerStatus>>,
    prepare_gate: Arc<Mutex<Option<Gate>>>,
    isolate_gate: Arc<Mutex<Option<Gate>>>,
    fail_prepare: Arc<AtomicBool>,
    fail_cleanup: Arc<AtomicBool>,
    limitation_tx: Arc<watch::Sender<Option<Limitation>>>,
}

impl TestIsolator {
    pub fn new(name: &str, events: Events) -> Self {
        let (limitation_tx, _) = watch::channel(None);
        Self {
            name: name.to_string(),
            nesting: false,
            events,
            launch_info: Arc::new(Mutex::new(None)),
            usage: Arc::new(Mutex::new(ResourceStatistics::default())),
            status: Arc::new(Mutex::new(ContainerStatus::default())),
            prepare_gate: Arc::new(Mutex::new(None)),
            isolate_gate: Arc::new(Mutex::new(None)),
            fail_prepare: Arc::new(AtomicBool::new(false)),
            fail_cleanup: Arc::new(AtomicBool::new(false)),
            limitation_tx: Arc::new(limitation_tx),
        }
    }

    pub fn nesting(mut self, nesting: bool) -> Self {
        self.nesting = nesting;
        self
    }

    pub fn set_launch_info(&self, info: LaunchInfo) {
        *self.launch_info.lock().unwrap() = Some(info);
    }

    pub fn set_usage(&self, usage: ResourceStatistics) {
        *self.usage.lock().unwrap() = usage;
    }

    pub fn set_status(&self, status: ContainerStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn gate_prepare(&self, gate: Gate) {
        *self.prepare_gate.lock().unwrap() = Some(gate);
    }

    pub fn gate_isolate(&self, gate: Gate) {
        *self.isolate_gate.lock().unwrap() = Some(gate);
    }

    pub fn fail_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }

    pub fn fail_cleanup(&self) {
        self.fail_cleanup.store(true, Ordering::SeqCst);
    }

    /// Resolves every pending `watch` with `limitation`.
    pub fn trigger_limitation(&self, limitation: Limitation) {
        self.limitation_tx.send_replace(Some(limitation));
    }
}

#[async_trait]
impl Isolator for TestIsolator {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_nesting(&self) -> bool {
        self.nesting
    }

    async fn recover(
        &self,
        states: &[ContainerRun],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()> {
        self.events.push(format!(
            "recover:{}:{}:{}",
            self.name,
            states.len(),
            orphans.len()
        ));
        Ok(())
    }

    async fn prepare(
        &self,
        id: &ContainerId,
        _config: &corral::ContainerConfig,
    ) -> Result<Option<LaunchInfo>> {
        self.events.push(format!("prepare:{}:{id}", self.name));
        let gate = self.prepare_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} prepare failed", self.name)));
        }
        Ok(self.launch_info.lock().unwrap().clone())
    }

    async fn isolate(&self, id: &ContainerId, pid: i32) -> Result<()> {
        self.events.push(format!("isolate:{}:{id}:{pid}", self.name));
        let gate = self.isolate_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(())
    }

    async fn watch(&self, _id: &ContainerId) -> Result<Limitation> {
        let mut rx = self.limitation_tx.subscribe();
        loop {
            if let Some(limitation) = rx.borrow_and_update().clone() {
                return Ok(limitation);
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    async fn update(&self, id: &ContainerId, _resources: &Resources) -> Result<()> {
        self.events.push(format!("update:{}:{id}", self.name));
        Ok(())
    }

    async fn usage(&self, _id: &ContainerId) -> Result<ResourceStatistics> {
        Ok(self.usage.lock().unwrap().clone())
    }

    async fn status(&self, _id: &ContainerId) -> Result<ContainerStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn cleanup(&self, id: &ContainerId) -> Result<()> {
        self.events.push(format!("cleanup:{}:{id}", self.name));
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} cleanup failed", self.name)));
        }
        Ok(())
    }
}

// =============================================================================
// Launcher
// =============================================================================

/// Launcher forking real `sleep` processes so pids, reaping, and kills
/// are the real thing.
pub struct TestLauncher {
    events: Events,
    pids: Mutex<HashMap<ContainerId, i32>>,
    extra_orphans: Mutex<HashSet<ContainerId>>,
    last_fork: Mutex<Option<(Environment, LaunchFlags)>>,
    fail_fork: AtomicBool,
    fail_destroy: AtomicBool,
}

impl TestLauncher {
    pub fn new(events: Events) -> Arc<Self> {
        Arc::new(Self {
            events,
            pids: Mutex::new(HashMap::new()),
            extra_orphans: Mutex::new(HashSet::new()),
            last_fork: Mutex::new(None),
            fail_fork: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
        })
    }

    /// Environment and flags of the most recent fork.
    pub fn last_fork(&self) -> Option<(Environment, LaunchFlags)> {
        self.last_fork.lock().unwrap().clone()
    }

    pub fn fail_fork(&self) {
        self.fail_fork.store(true, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self) {
        self.fail_destroy.store(true, Ordering::SeqCst);
    }

    pub fn add_extra_orphan(&self, id: ContainerId) {
        self.extra_orphans.lock().unwrap().insert(id);
    }

    pub fn pid_of(&self, id: &ContainerId) -> Option<i32> {
        self.pids.lock().unwrap().get(id).copied()
    }
}

impl Drop for TestLauncher {
    fn drop(&mut self) {
        // No stray sleeps outliving a test.
        for pid in self.pids.lock().unwrap().values() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(*pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }
}

#[async_trait]
impl Launcher for TestLauncher {
    async fn recover(&self, states: &[ContainerRun]) -> Result<HashSet<ContainerId>> {
        for run in states {
            self.events.push(format!("launcher_recover:{}", run.id));
        }
        Ok(self.extra_orphans.lock().unwrap().clone())
    }

    fn fork(
        &self,
        id: &ContainerId,
        _helper: &Path,
        _argv: &[String],
        _io: &SubprocessIo,
        flags: &LaunchFlags,
        environment: &Environment,
        _namespaces: CloneFlags,
    ) -> Result<i32> {
        if self.fail_fork.load(Ordering::SeqCst) {
            return Err(Error::Internal("fork refused".to_string()));
        }
        *self.last_fork.lock().unwrap() = Some((environment.clone(), flags.clone()));

        let child = std::process::Command::new("sleep")
            .arg("1000")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::Internal(format!("spawn failed: {e}")))?;

        let pid = child.id() as i32;
        self.events.push(format!("fork:{id}"));
        self.pids.lock().unwrap().insert(id.clone(), pid);
        Ok(pid)
    }

    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        Ok(ContainerStatus {
            executor_pid: self.pid_of(id),
            ip_addresses: Vec::new(),
        })
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.events.push(format!("launcher_destroy:{id}"));
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::Internal("kill refused".to_string()));
        }
        if let Some(pid) = self.pid_of(id) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        Ok(())
    }
}

// =============================================================================
// Provisioner
// =============================================================================

pub struct TestProvisioner {
    events: Events,
    info: Mutex<Option<ProvisionInfo>>,
    gate: Mutex<Option<Gate>>,
    fail: AtomicBool,
}

impl TestProvisioner {
    pub fn new(events: Events) -> Arc<Self> {
        Arc::new(Self {
            events,
            info: Mutex::new(None),
            gate: Mutex::new(None),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_info(&self, info: ProvisionInfo) {
        *self.info.lock().unwrap() = Some(info);
    }

    pub fn gate(&self, gate: Gate) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provisioner for TestProvisioner {
    async fn recover(&self, known: &HashSet<ContainerId>) -> Result<()> {
        self.events
            .push(format!("provisioner_recover:{}", known.len()));
        Ok(())
    }

    async fn provision(&self, id: &ContainerId, _image: &Image) -> Result<ProvisionInfo> {
        self.events.push(format!("provision:{id}"));
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Internal("provision failed".to_string()));
        }
        Ok(self.info.lock().unwrap().clone().unwrap_or(ProvisionInfo {
            rootfs: PathBuf::from("/var/lib/rootfs").join(id.value()),
            docker_manifest: None,
            appc_manifest: None,
        }))
    }

    async fn destroy(&self, id: &ContainerId) -> Result<bool> {
        self.events.push(format!("provisioner_destroy:{id}"));
        Ok(true)
    }
}

// =============================================================================
// Fetcher
// =============================================================================

pub struct TestFetcher {
    events: Events,
    gate: Mutex<Option<Gate>>,
    killed_tx: watch::Sender<Option<ContainerId>>,
}

impl TestFetcher {
    pub fn new(events: Events) -> Arc<Self> {
        let (killed_tx, _) = watch::channel(None);
        Arc::new(Self {
            events,
            gate: Mutex::new(None),
            killed_tx,
        })
    }

    pub fn gate(&self, gate: Gate) {
        *self.gate.lock().unwrap() = Some(gate);
    }
}

#[async_trait]
impl Fetcher for TestFetcher {
    async fn fetch(
        &self,
        id: &ContainerId,
        _command: &CommandSpec,
        directory: &Path,
        _user: Option<&str>,
        _slave_id: &str,
    ) -> Result<()> {
        self.events
            .push(format!("fetch:{id}:{}", directory.display()));

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let mut killed = self.killed_tx.subscribe();
            tokio::select! {
                _ = gate.pass() => {}
                _ = killed.wait_for(|k| k.as_ref() == Some(id)) => {
                    return Err(Error::Internal("fetch killed".to_string()));
                }
            }
        }
        Ok(())
    }

    fn kill(&self, id: &ContainerId) {
        self.events.push(format!("fetcher_kill:{id}"));
        self.killed_tx.send_replace(Some(id.clone()));
    }
}

// =============================================================================
// Logger
// =============================================================================

pub struct TestLogger {
    events: Events,
}

impl TestLogger {
    pub fn new(events: Events) -> Arc<Self> {
        Arc::new(Self { events })
    }
}

#[async_trait]
impl ContainerLogger for TestLogger {
    async fn recover(&self, executor: &ExecutorSpec, _directory: &Path) -> Result<()> {
        self.events
            .push(format!("logger_recover:{}", executor.executor_id));
        Ok(())
    }

    async fn prepare(
        &self,
        _executor: Option<&ExecutorSpec>,
        directory: &Path,
    ) -> Result<SubprocessIo> {
        self.events.push("logger_prepare".to_string());
        Ok(SubprocessIo::sandbox(directory))
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// A containerizer wired to the mocks above, with everything the tests
/// need to poke at.
pub struct Fixture {
    pub tmp: TempDir,
    pub config: Config,
    pub events: Events,
    pub isolators: Vec<TestIsolator>,
    pub launcher: Arc<TestLauncher>,
    pub provisioner: Arc<TestProvisioner>,
    pub fetcher: Arc<TestFetcher>,
    pub logger: Arc<TestLogger>,
    pub containerizer: Containerizer,
}

impl Fixture {
    /// Three recording isolators named `test/a`, `test/b`, `test/c`, in
    /// that declared order.
    pub fn new() -> Self {
        let events = Events::default();
        let isolators = vec![
            TestIsolator::new("test/a", events.clone()),
            TestIsolator::new("test/b", events.clone()),
            TestIsolator::new("test/c", events.clone()),
        ];
        Self::with_isolators(events, isolators)
    }

    /// Like [`Fixture::new`], with a post-fetch hook installed.
    pub fn with_post_fetch_hook(
        hook: impl Fn(&ContainerId, &Path) + Send + Sync + 'static,
    ) -> Self {
        let events = Events::default();
        let isolators = vec![
            TestIsolator::new("test/a", events.clone()),
            TestIsolator::new("test/b", events.clone()),
            TestIsolator::new("test/c", events.clone()),
        ];
        Self::build(events, isolators, Some(Box::new(hook)))
    }

    pub fn with_isolators(events: Events, isolators: Vec<TestIsolator>) -> Self {
        Self::build(events, isolators, None)
    }

    fn build(
        events: Events,
        isolators: Vec<TestIsolator>,
        post_fetch_hook: Option<corral::PostFetchHook>,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            work_dir: tmp.path().join("work"),
            runtime_dir: tmp.path().join("runtime"),
            launcher_dir: tmp.path().join("libexec"),
            sandbox_directory: PathBuf::from("/mnt/sandbox"),
            isolation: isolators
                .iter()
                .map(|i| i.name().to_string())
                .collect::<Vec<_>>()
                .join(","),
            default_container: None,
        };

        let launcher = TestLauncher::new(events.clone());
        let provisioner = TestProvisioner::new(events.clone());
        let fetcher = TestFetcher::new(events.clone());
        let logger = TestLogger::new(events.clone());

        let mut registry = IsolatorRegistry::new();
        for isolator in &isolators {
            let prototype = isolator.clone();
            registry.register(isolator.name(), move |_config| {
                Ok(Box::new(prototype.clone()) as Box<dyn Isolator>)
            });
        }

        let mut builder = Containerizer::builder(config.clone())
            .isolator_registry(registry)
            .launcher(launcher.clone())
            .provisioner(provisioner.clone())
            .fetcher(fetcher.clone())
            .logger(logger.clone());
        if let Some(hook) = post_fetch_hook {
            builder = builder.post_fetch_hook(move |id, directory| hook(id, directory));
        }
        let containerizer = builder.build().unwrap();

        Self {
            tmp,
            config,
            events,
            isolators,
            launcher,
            provisioner,
            fetcher,
            logger,
            containerizer,
        }
    }

    /// Creates a sandbox directory for a top-level container.
    pub fn sandbox(&self, name: &str) -> PathBuf {
        let directory = self.tmp.path().join("sandboxes").join(name);
        std::fs::create_dir_all(&directory).unwrap();
        directory
    }

    /// A plain top-level launch with no task and no image.
    pub fn executor_launch(&self, name: &str) -> ExecutorLaunch {
        ExecutorLaunch {
            task: None,
            executor: ExecutorSpec {
                executor_id: format!("executor-{name}"),
                framework_id: "framework-1".to_string(),
                command: CommandSpec::shell("sleep 30"),
                resources: Resources::default(),
                container: None,
            },
            directory: self.sandbox(name),
            user: None,
            slave_id: "slave-1".to_string(),
            environment: Environment::new(),
            checkpoint: false,
        }
    }

    pub fn nested_launch(&self) -> NestedLaunch {
        NestedLaunch {
            command: CommandSpec::shell("true"),
            container: None,
            user: None,
            slave_id: "slave-1".to_string(),
        }
    }
}

/// Polls `predicate` until it holds or the timeout expires.
pub async fn eventually(predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// [`eventually`] for predicates that need to await.
pub async fn eventually_async<F, Fut>(predicate: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
