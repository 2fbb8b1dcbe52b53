//! Execution request and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 12 hex characters, used in container and directory names.
    pub fn short(&self) -> String {
        let mut simple = self.0.simple().to_string();
        simple.truncate(12);
        simple
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A single-shot request to run source code.
///
/// The id is assigned on construction so a caller can `kill` the execution
/// from another task while `execute` is still pending.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: ExecutionId,
    language: String,
    code: String,
    args: Vec<String>,
    stdin: Option<String>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            language: language.into(),
            code: code.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }
}

/// Lifecycle state of an execution.
///
/// `Pending -> Running -> {Completed | Failed | Timeout | Killed}`. A pending
/// execution may also fail directly (rejected or never started).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Killed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Killed
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Killed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// Which executor produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Container,
    Process,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: ExecutionId,
    pub language: String,
    pub state: ExecutionState,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timed_out: bool,
    pub killed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_error: Option<String>,
    /// Infrastructure cause or explanatory message for non-completed states
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorKind>,
}

impl ExecutionResult {
    /// Fresh result in the `Pending` state.
    pub fn pending(id: ExecutionId, language: impl Into<String>) -> Self {
        Self {
            id,
            language: language.into(),
            state: ExecutionState::Pending,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: -1,
            duration_ms: 0,
            started_at: None,
            completed_at: None,
            timed_out: false,
            killed: false,
            compile_error: None,
            error: None,
            executor: None,
        }
    }

    /// A result that failed before running (rejection, bad input).
    pub fn rejected(id: ExecutionId, language: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::pending(id, language);
        result.fail(message);
        result
    }

    pub fn mark_running(&mut self) {
        if self.state.can_transition_to(ExecutionState::Running) {
            self.state = ExecutionState::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Moves the result into a terminal state. The first terminal state wins;
    /// later calls are ignored.
    pub fn finish(&mut self, state: ExecutionState, exit_code: i32) {
        if !self.state.can_transition_to(state) {
            return;
        }

        let now = Utc::now();
        self.state = state;
        self.exit_code = exit_code;
        self.timed_out = state == ExecutionState::Timeout;
        self.killed = state == ExecutionState::Killed;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .and_then(|start| (now - start).to_std().ok())
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    }

    /// Terminal `Failed` with an explanatory message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.finish(ExecutionState::Failed, self.exit_code);
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.state == ExecutionState::Completed
    }
}
