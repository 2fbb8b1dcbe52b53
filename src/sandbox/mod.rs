//! Sandbox for running untrusted code.
//!
//! [`Sandbox`] is the single entry point: it admits requests, resolves the
//! language profile, prepares a throwaway workspace and hands the job to the
//! executor picked at startup (containers when the engine is reachable, bare
//! process groups otherwise). Every execution ends in exactly one terminal
//! state, one stats update and one audit entry.

mod cleanup;
mod docker;
mod error;
mod executor;
mod image;
mod network;
mod process;
mod registry;
mod workspace;

pub use error::SandboxError;
pub use executor::{Capabilities, IsolationUnit, KILLED_EXIT_CODE, TIMEOUT_EXIT_CODE};
pub use image::{build_images, image_status, ImageStatus};
pub use network::NetworkMode;

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEntry, AuditLogger};
use crate::cache::PackageCacheManager;
use crate::config::{Config, ExecutorMode};
use crate::language::ProfileRegistry;
use crate::result::{ExecutionId, ExecutionRequest, ExecutionResult, ExecutionState, ExecutorKind};
use crate::seccomp::SeccompHandle;
use crate::stats::{AdmissionGate, SandboxStats, StatsCounters};

use cleanup::CleanupLoop;
use docker::ContainerExecutor;
use executor::{ExecutionControl, Executor, Job};
use process::ProcessExecutor;
use registry::{ActiveExecution, ExecutionRegistry};
use workspace::WorkspaceManager;

const REJECTED_MESSAGE: &str = "Too many concurrent executions. Please try again later.";

/// What one cleanup pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Live executions older than the max age that were killed
    pub killed_stale: u32,
    /// Orphaned isolation units removed by the executor
    pub reaped_units: u32,
    /// Leftover workspace directories deleted
    pub removed_workspaces: u32,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.killed_stale == 0 && self.reaped_units == 0 && self.removed_workspaces == 0
    }
}

/// State shared between the facade and its cleanup loop.
#[derive(Debug)]
pub(crate) struct Inner {
    executor: Box<dyn Executor>,
    profiles: ProfileRegistry,
    workspaces: WorkspaceManager,
    registry: ExecutionRegistry,
    gate: AdmissionGate,
    stats: StatsCounters,
    audit: AuditLogger,
    max_age: Duration,
    closed: AtomicBool,
}

impl Inner {
    /// Cancels a live execution and tears down its current unit. The
    /// execute future may already be gone, so the unit is not left to it.
    async fn kill_active(&self, active: &ActiveExecution) {
        if active.control.cancel.is_cancelled() {
            return;
        }
        active.control.cancel.cancel();
        if let Some(unit) = active.control.unit() {
            self.executor.terminate(&unit).await;
        }
    }

    /// Counts a terminal result and writes its audit entry.
    fn record(&self, result: &ExecutionResult, unit_id: &str, source_hash: &str) {
        self.stats.record(result.state);
        self.audit
            .log(&AuditEntry::finished(result, unit_id, source_hash));
    }

    pub(crate) async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (id, active) in self.registry.entries() {
            let age = active.started.elapsed();
            if age <= self.max_age {
                continue;
            }
            warn!(
                "Killing stale execution {} ({}, running for {}s in {})",
                id,
                active.language,
                age.as_secs(),
                active.workspace.display()
            );
            self.kill_active(&active).await;
            report.killed_stale += 1;
        }

        match self.executor.reap_orphans(self.max_age).await {
            Ok(reaped) => report.reaped_units = reaped,
            Err(e) => warn!("Orphan reaping failed, retrying next sweep: {}", e),
        }

        report.removed_workspaces = self.workspaces.sweep_old(self.max_age);
        report
    }
}

/// Ties a live execution to its registry entry.
///
/// Completing records the terminal state. Dropping it without completing
/// means the caller abandoned the execute future: the execution is cancelled,
/// its current unit torn down on the runtime, and the run counted as killed.
struct Registration {
    inner: Arc<Inner>,
    control: ExecutionControl,
    snapshot: ExecutionResult,
    source_hash: String,
    completed: bool,
}

impl Registration {
    fn complete(mut self, state: ExecutionState) {
        self.completed = true;
        self.inner.registry.finish(&self.snapshot.id, state);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let id = self.snapshot.id;
        warn!("Execution {} abandoned by its caller; killing it", id);
        self.control.cancel.cancel();
        self.inner.registry.finish(&id, ExecutionState::Killed);

        if let Some(unit) = self.control.unit() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let inner = Arc::clone(&self.inner);
                    handle.spawn(async move { inner.executor.terminate(&unit).await });
                }
                Err(_) => warn!("No runtime to tear down {} of abandoned execution {}", unit, id),
            }
        }

        let mut result = self.snapshot.clone();
        result.error = Some("Execution abandoned by caller".to_string());
        result.finish(ExecutionState::Killed, KILLED_EXIT_CODE);
        self.inner
            .record(&result, &self.control.unit_id(), &self.source_hash);
    }
}

/// Multi-language execution sandbox.
#[derive(Debug)]
pub struct Sandbox {
    inner: Arc<Inner>,
    cleanup: Mutex<Option<CleanupLoop>>,
}

impl Sandbox {
    /// Creates a sandbox with the executor selected by `executor.mode`.
    ///
    /// `auto` falls back to the process executor when the container engine
    /// cannot be reached; `container` fails instead.
    pub async fn new(config: Config) -> Result<Self, SandboxError> {
        let profiles = ProfileRegistry::new(&config)?;
        let workspaces = WorkspaceManager::new(config.workspace_root(), config.cleanup_delay())?;
        let cache = PackageCacheManager::new(config.cache_dir(), config.cache.enabled);

        let executor: Box<dyn Executor> = match config.executor.mode {
            ExecutorMode::Process => Box::new(ProcessExecutor::new(&config, cache)),
            mode => match docker::connect(config.engine.socket.as_deref()).await {
                Ok(docker) => {
                    let seccomp = if config.security.seccomp && cfg!(target_os = "linux") {
                        Some(SeccompHandle::install(workspaces.root())?)
                    } else {
                        None
                    };
                    Box::new(
                        ContainerExecutor::new(docker, &config, &profiles, seccomp, cache).await,
                    )
                }
                Err(e) if mode == ExecutorMode::Auto => {
                    warn!("{}; falling back to the process executor", e);
                    Box::new(ProcessExecutor::new(&config, cache))
                }
                Err(e) => return Err(e),
            },
        };

        Ok(Self::assemble(&config, profiles, workspaces, executor))
    }

    /// Creates a sandbox around an existing executor.
    #[cfg(test)]
    pub(crate) fn with_executor(
        config: &Config,
        executor: Box<dyn Executor>,
    ) -> Result<Self, SandboxError> {
        let profiles = ProfileRegistry::new(config)?;
        let workspaces = WorkspaceManager::new(config.workspace_root(), config.cleanup_delay())?;
        Ok(Self::assemble(config, profiles, workspaces, executor))
    }

    fn assemble(
        config: &Config,
        profiles: ProfileRegistry,
        workspaces: WorkspaceManager,
        executor: Box<dyn Executor>,
    ) -> Self {
        let audit = if config.audit.enabled {
            AuditLogger::open(&config.audit_path())
        } else {
            AuditLogger::disabled()
        };

        info!(
            "Sandbox ready: {} executor, {} languages, up to {} concurrent executions",
            executor.kind(),
            profiles.list().len(),
            config.concurrency.max_concurrent
        );

        let inner = Arc::new(Inner {
            executor,
            profiles,
            workspaces,
            registry: ExecutionRegistry::default(),
            gate: AdmissionGate::new(config.concurrency.max_concurrent),
            stats: StatsCounters::default(),
            audit,
            max_age: config.max_age(),
            closed: AtomicBool::new(false),
        });

        let cleanup = config
            .cleanup
            .enabled
            .then(|| CleanupLoop::start(Arc::downgrade(&inner), config.cleanup_interval()));

        Self {
            inner,
            cleanup: Mutex::new(cleanup),
        }
    }

    /// Runs a request to a terminal state.
    ///
    /// Problems with the submitted program, and rejections, come back as a
    /// `failed` result. `Err` means the host could not prepare the execution.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let inner = &*self.inner;
        let id = request.id();

        if inner.closed.load(Ordering::Acquire) {
            return Ok(self.reject(id, request.language(), "Sandbox is shut down"));
        }

        let Some(_permit) = inner.gate.try_acquire() else {
            warn!("Rejected execution {}: concurrency limit reached", id);
            return Ok(self.reject(id, request.language(), REJECTED_MESSAGE));
        };

        let profile = match inner.profiles.get(request.language()) {
            Ok(profile) => profile,
            Err(e) => return Ok(self.reject(id, request.language(), e.to_string())),
        };

        let workspace = inner.workspaces.create(id)?;
        let source = profile.prepare_source(request.code());
        let hash = audit::source_hash(request.code());

        let mut result = ExecutionResult::pending(id, profile.id);
        result.executor = Some(inner.executor.kind());

        if let Err(e) = workspace.write_source(&source) {
            result.fail(format!("failed to write source: {e}"));
            inner.record(&result, "", &hash);
            return Ok(result);
        }

        let control = ExecutionControl::default();
        inner.registry.register(
            id,
            ActiveExecution {
                control: control.clone(),
                language: profile.id,
                started: Instant::now(),
                workspace: workspace.path().to_path_buf(),
            },
        );

        info!("Executing {} ({})", id, profile.id);
        result.mark_running();
        inner
            .audit
            .log(&AuditEntry::started(id, profile.id, "", &hash));

        let registration = Registration {
            inner: Arc::clone(&self.inner),
            control: control.clone(),
            snapshot: result.clone(),
            source_hash: hash,
            completed: false,
        };

        let job = Job {
            id,
            profile,
            source: &source,
            workspace: workspace.path(),
            stdin: request.stdin(),
            args: request.args(),
            deadline: tokio::time::Instant::now() + profile.timeout,
        };
        inner.executor.execute(job, &mut result, &control).await;

        debug!(
            "Execution {} finished: {} (exit {}, {}ms)",
            id, result.state, result.exit_code, result.duration_ms
        );
        inner.record(&result, &control.unit_id(), &registration.source_hash);
        registration.complete(result.state);
        Ok(result)
    }

    /// Runs a file, inferring the language from its extension.
    pub async fn execute_file(
        &self,
        path: &Path,
        args: Vec<String>,
        stdin: Option<String>,
    ) -> Result<ExecutionResult, SandboxError> {
        let Some(profile) = self.inner.profiles.language_for_path(path) else {
            let message = format!("Unsupported file type: {}", path.display());
            return Ok(self.reject(ExecutionId::new(), "unknown", message));
        };
        let language = profile.id;

        let code = match tokio::fs::read_to_string(path).await {
            Ok(code) => code,
            Err(e) => {
                let message = format!("Failed to read {}: {e}", path.display());
                return Ok(self.reject(ExecutionId::new(), language, message));
            }
        };

        let mut request = ExecutionRequest::new(language, code).with_args(args);
        if let Some(stdin) = stdin {
            request = request.with_stdin(stdin);
        }
        self.execute(request).await
    }

    /// Stops a running execution. Killing an execution that already finished
    /// is a no-op; an id the sandbox has never seen is an error.
    pub async fn kill(&self, id: &ExecutionId) -> Result<(), SandboxError> {
        let inner = &*self.inner;
        match inner.registry.get(id) {
            Some(active) => {
                info!("Killing execution {}", id);
                inner.kill_active(&active).await;
                Ok(())
            }
            None if inner.registry.finished_state(id).is_some() => {
                debug!("Execution {} already finished", id);
                Ok(())
            }
            None => Err(SandboxError::unknown_execution(id)),
        }
    }

    /// Where an execution stands: `Running` while live, its terminal state
    /// once finished, `None` for ids never admitted or long forgotten.
    pub fn status(&self, id: &ExecutionId) -> Option<ExecutionState> {
        let registry = &self.inner.registry;
        if registry.get(id).is_some() {
            return Some(ExecutionState::Running);
        }
        registry.finished_state(id)
    }

    /// Number of executions currently running.
    pub fn active_executions(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn stats(&self) -> SandboxStats {
        self.inner.stats.snapshot(&self.inner.gate)
    }

    /// Runs one cleanup pass immediately.
    pub async fn sweep(&self) -> SweepReport {
        self.inner.sweep().await
    }

    pub fn executor_kind(&self) -> ExecutorKind {
        self.inner.executor.kind()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.executor.capabilities()
    }

    /// Shuts the sandbox down: stops the cleanup loop, kills everything still
    /// running, closes the executor and removes the workspace root. Later
    /// requests are rejected. Safe to call more than once.
    pub async fn cleanup(&self) -> Result<(), SandboxError> {
        let inner = &*self.inner;
        inner.closed.store(true, Ordering::Release);

        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cleanup) = cleanup {
            cleanup.stop().await;
        }

        for (id, active) in inner.registry.entries() {
            debug!("Killing {} during shutdown", id);
            inner.kill_active(&active).await;
        }

        inner.executor.close().await;
        inner.workspaces.remove_root()?;
        info!("Sandbox shut down");
        Ok(())
    }

    /// Builds a `failed` result for a request that never ran and records it.
    fn reject(&self, id: ExecutionId, language: &str, message: impl Into<String>) -> ExecutionResult {
        let mut result = ExecutionResult::rejected(id, language, message);
        result.executor = Some(self.inner.executor.kind());
        self.inner.record(&result, "", "");
        result
    }
}
