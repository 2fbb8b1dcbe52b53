//! Formatting functions for command output.
//!
//! Pure functions that return strings; the commands do the printing.

use colored::Colorize;
use std::fmt::Write;

use execbox::sandbox::ImageStatus;
use execbox::{ExecutionResult, ExecutionState, LanguageProfile};

/// One-line summary of how an execution ended.
pub(crate) fn format_status_line(result: &ExecutionResult) -> String {
    let state = match result.state {
        ExecutionState::Completed => "completed".green().bold(),
        ExecutionState::Timeout => "timeout".yellow().bold(),
        ExecutionState::Killed => "killed".red().bold(),
        ExecutionState::Failed => "failed".red().bold(),
        ExecutionState::Pending | ExecutionState::Running => result.state.to_string().normal(),
    };

    let mut line = format!(
        "{} {} in {}ms (exit {})",
        state, result.language, result.duration_ms, result.exit_code
    );
    if let Some(executor) = result.executor {
        let _ = write!(line, " [{executor}]");
    }
    if let Some(error) = &result.error {
        let _ = write!(line, ": {error}");
    }
    line
}

/// Notes about truncated output, if any.
pub(crate) fn format_truncation(result: &ExecutionResult) -> Option<String> {
    let streams: Vec<&str> = [
        (result.stdout_truncated, "stdout"),
        (result.stderr_truncated, "stderr"),
    ]
    .into_iter()
    .filter_map(|(truncated, name)| truncated.then_some(name))
    .collect();

    if streams.is_empty() {
        None
    } else {
        Some(format!("{} truncated", streams.join(" and ")))
    }
}

/// Human-readable byte size.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_bytes(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes >= MIB {
        format!("{}M", bytes / MIB)
    } else {
        format!("{:.1}K", bytes as f64 / 1024.0)
    }
}

/// Table of language profiles and their limits.
pub(crate) fn format_language_table(profiles: &[LanguageProfile]) -> String {
    let mut out = format!(
        "{:<12} {:<8} {:>6} {:>8} {:>6} {:>8}  {}\n",
        "LANGUAGE", "MEMORY", "CPUS", "TIMEOUT", "PIDS", "SCRATCH", "ALIASES"
    );
    for profile in profiles {
        let _ = writeln!(
            out,
            "{:<12} {:<8} {:>6.2} {:>7}s {:>6} {:>8}  {}",
            profile.id,
            format_bytes(profile.memory_bytes),
            profile.cpus,
            profile.timeout.as_secs(),
            profile.pids,
            format_bytes(profile.scratch_bytes),
            profile.aliases().join(", ")
        );
    }
    out
}

/// Table of hardened image availability.
pub(crate) fn format_image_table(statuses: &[ImageStatus]) -> String {
    let mut out = String::new();
    for status in statuses {
        let marker = if status.present {
            "present".green()
        } else {
            "missing".yellow()
        };
        let _ = write!(out, "{:<12} {:<40} {}", status.language, status.image, marker);
        if !status.present {
            let _ = write!(out, " (falls back to {})", status.fallback);
        }
        out.push('\n');
    }
    out
}
