//! Append-only audit log.
//!
//! One JSON object per line. Writes go through a lossy non-blocking writer,
//! so a slow or broken log never delays an execution. Failures are reported
//! with `warn!` and otherwise ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

use crate::result::{ExecutionId, ExecutionResult, ExecutionState};

const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Start,
    Complete,
    Timeout,
    Kill,
    Error,
}

impl AuditAction {
    /// Terminal action recorded for a finished result
    pub fn for_result(result: &ExecutionResult) -> Self {
        match result.state {
            ExecutionState::Timeout => Self::Timeout,
            ExecutionState::Killed => Self::Kill,
            ExecutionState::Failed if result.error.is_some() => Self::Error,
            _ => Self::Complete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub execution_id: ExecutionId,
    /// Container name or process group id, empty if none was created
    pub unit_id: String,
    pub language: String,
    pub action: AuditAction,
    pub duration_ms: u64,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 of the submitted source
    pub source_hash: String,
}

impl AuditEntry {
    pub fn started(id: ExecutionId, language: &str, unit_id: &str, source_hash: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            execution_id: id,
            unit_id: unit_id.to_string(),
            language: language.to_string(),
            action: AuditAction::Start,
            duration_ms: 0,
            exit_code: 0,
            error: None,
            source_hash: source_hash.to_string(),
        }
    }

    pub fn finished(result: &ExecutionResult, unit_id: &str, source_hash: &str) -> Self {
        Self {
            timestamp: result.completed_at.unwrap_or_else(Utc::now),
            execution_id: result.id,
            unit_id: unit_id.to_string(),
            language: result.language.clone(),
            action: AuditAction::for_result(result),
            duration_ms: result.duration_ms,
            exit_code: result.exit_code,
            error: result.error.as_deref().map(truncate_error),
            source_hash: source_hash.to_string(),
        }
    }
}

/// Hex SHA-256 of source text.
pub fn source_hash(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_ERROR_CHARS {
        return error.to_string();
    }
    let mut truncated: String = error.chars().take(MAX_ERROR_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Best-effort JSON-lines audit writer.
pub struct AuditLogger {
    writer: Option<NonBlocking>,
    _guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("enabled", &self.writer.is_some())
            .finish()
    }
}

impl AuditLogger {
    /// A logger that drops every entry.
    pub fn disabled() -> Self {
        Self {
            writer: None,
            _guard: None,
        }
    }

    /// Opens `path` for appending. Falls back to a disabled logger, with a
    /// warning, if the file cannot be opened.
    pub fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Audit log directory {} unavailable: {}", parent.display(), e);
                return Self::disabled();
            }
        }

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                Self {
                    writer: Some(writer),
                    _guard: Some(guard),
                }
            }
            Err(e) => {
                warn!("Audit log {} could not be opened: {}", path.display(), e);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Appends one entry. Never fails.
    pub fn log(&self, entry: &AuditEntry) {
        let Some(writer) = &self.writer else {
            return;
        };

        let mut line = match serde_json::to_vec(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize audit entry: {}", e);
                return;
            }
        };
        line.push(b'\n');

        let mut writer = writer.clone();
        if let Err(e) = writer.write_all(&line) {
            warn!("Failed to write audit entry: {}", e);
        }
    }
}
