//! `exec` and `run`: execute code once and report the result.

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::warn;

use execbox::{ExecutionRequest, ExecutionResult, Sandbox};

use super::format::{format_status_line, format_truncation};
use super::GlobalOptions;

/// Executes inline code or the contents of `code_file` as `language`.
pub async fn exec(
    options: &GlobalOptions,
    language: &str,
    code: Option<String>,
    code_file: Option<PathBuf>,
    stdin: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    let code = match (code, code_file) {
        (Some(code), _) => code,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("Either --code or --code-file is required"),
    };

    let mut request = ExecutionRequest::new(language, code);
    if let Some(stdin) = stdin {
        request = request.with_stdin(stdin);
    }

    let sandbox = Sandbox::new(options.load_config()?).await?;
    let result = sandbox.execute(request).await;
    shutdown(&sandbox).await;

    report(&result?, json)
}

/// Executes a file, inferring the language from its extension.
pub async fn run(
    options: &GlobalOptions,
    file: &Path,
    args: Vec<String>,
    stdin: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    let sandbox = Sandbox::new(options.load_config()?).await?;
    let result = sandbox.execute_file(file, args, stdin).await;
    shutdown(&sandbox).await;

    report(&result?, json)
}

async fn shutdown(sandbox: &Sandbox) {
    if let Err(e) = sandbox.cleanup().await {
        warn!("Sandbox cleanup failed: {}", e);
    }
}

fn report(result: &ExecutionResult, json: bool) -> Result<ExitCode> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(result).context("Failed to serialize result")?
        );
    } else {
        print!("{}", result.stdout);
        std::io::stdout().flush().ok();
        eprint!("{}", result.stderr);
        if let Some(note) = format_truncation(result) {
            eprintln!("{} {}", "!".yellow(), note);
        }
        eprintln!("{}", format_status_line(result));
    }

    Ok(exit_code(result))
}

/// Process exit status mirroring the execution's.
fn exit_code(result: &ExecutionResult) -> ExitCode {
    if result.succeeded() {
        return ExitCode::SUCCESS;
    }
    u8::try_from(result.exit_code)
        .ok()
        .filter(|&code| code != 0)
        .map_or(ExitCode::FAILURE, ExitCode::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use execbox::{ExecutionId, ExecutionState};

    fn finished(state: ExecutionState, code: i32) -> ExecutionResult {
        let mut result = ExecutionResult::pending(ExecutionId::new(), "shell");
        result.mark_running();
        result.finish(state, code);
        result
    }

    #[test]
    fn test_exit_code_mirrors_result() {
        assert_eq!(exit_code(&finished(ExecutionState::Completed, 0)), ExitCode::SUCCESS);
        assert_eq!(exit_code(&finished(ExecutionState::Failed, 3)), ExitCode::from(3));
        assert_eq!(exit_code(&finished(ExecutionState::Timeout, 124)), ExitCode::from(124));
        // Rejections keep exit_code -1
        let rejected = ExecutionResult::rejected(ExecutionId::new(), "shell", "busy");
        assert_eq!(exit_code(&rejected), ExitCode::FAILURE);
    }
}
