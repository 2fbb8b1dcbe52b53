//! The executor seam shared by the container and process backends.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::SandboxError;
use crate::language::{LanguageProfile, PreparedSource};
use crate::result::{ExecutionId, ExecutionResult, ExecutorKind};

/// Exit code reported when the deadline fires.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported for killed executions (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// Everything an executor needs to run one request.
#[derive(Debug)]
pub(crate) struct Job<'a> {
    pub id: ExecutionId,
    pub profile: &'a LanguageProfile,
    pub source: &'a PreparedSource,
    /// Host directory holding the source file
    pub workspace: &'a Path,
    pub stdin: Option<&'a str>,
    pub args: &'a [String],
    pub deadline: Instant,
}

/// The OS-level thing created for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationUnit {
    Container { name: String },
    ProcessGroup { pgid: i32 },
}

impl fmt::Display for IsolationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container { name } => write!(f, "{name}"),
            Self::ProcessGroup { pgid } => write!(f, "pgid:{pgid}"),
        }
    }
}

/// Cloneable cancellation flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Out-of-band handles for a running execution, shared with the registry.
///
/// The unit slot holds whatever is alive right now; a compiled language
/// replaces it between the compile and run steps and clears it once the
/// unit is gone, so `kill` never signals a stale process group.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionControl {
    pub cancel: CancelToken,
    unit: Arc<Mutex<UnitSlot>>,
}

#[derive(Debug, Default)]
struct UnitSlot {
    current: Option<IsolationUnit>,
    /// Last unit ever set, kept for the audit trail
    last_id: String,
}

impl ExecutionControl {
    pub fn set_unit(&self, unit: IsolationUnit) {
        let mut slot = self.unit.lock().unwrap_or_else(PoisonError::into_inner);
        slot.last_id = unit.to_string();
        slot.current = Some(unit);
    }

    pub fn clear_unit(&self) {
        self.unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current = None;
    }

    pub fn unit(&self) -> Option<IsolationUnit> {
        self.unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// Id of the most recent unit, empty if none was ever created.
    pub fn unit_id(&self) -> String {
        self.unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_id
            .clone()
    }
}

/// Isolation guarantees of the active executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub executor: ExecutorKind,
    pub filesystem_isolation: bool,
    pub network_isolation: bool,
    pub syscall_filtering: bool,
    pub read_only_root: bool,
    pub memory_limit: bool,
    pub cpu_limit: bool,
    pub process_limit: bool,
}

/// A backend that runs prepared jobs in some kind of isolation unit.
///
/// `execute` never fails: every outcome, including infrastructure trouble
/// after the job started, is written into `result`.
#[async_trait]
pub(crate) trait Executor: Send + Sync + fmt::Debug {
    fn kind(&self) -> ExecutorKind;

    fn capabilities(&self) -> Capabilities;

    /// Runs the job to a terminal state. The result is `Running` on entry.
    async fn execute(&self, job: Job<'_>, result: &mut ExecutionResult, ctl: &ExecutionControl);

    /// Graceful stop, grace period, then forced removal. Idempotent and
    /// bounded in time.
    async fn terminate(&self, unit: &IsolationUnit);

    /// Removes units this executor created that are older than `max_age`.
    async fn reap_orphans(&self, max_age: Duration) -> Result<u32, SandboxError>;

    async fn close(&self);
}

/// Output buffer that keeps the first `limit` bytes and drops the rest.
#[derive(Debug)]
pub(crate) struct CappedBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Lossy UTF-8 text and whether anything was dropped.
    pub fn finish(self) -> (String, bool) {
        (String::from_utf8_lossy(&self.buf).into_owned(), self.truncated)
    }
}
