//! Process executor: the insecure fallback for hosts without a container
//! engine.
//!
//! Code runs as a native child in its own process group with soft limits
//! (`ulimit -v`, `ulimit -t`). There is no filesystem, syscall or network
//! isolation beyond that.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

use super::executor::{
    Capabilities, CappedBuffer, ExecutionControl, Executor, IsolationUnit, Job,
    KILLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use super::{NetworkMode, SandboxError};
use crate::cache::PackageCacheManager;
use crate::config::Config;
use crate::language::{CommandContext, LanguageProfile};
use crate::result::{ExecutionResult, ExecutionState, ExecutorKind};

/// Applies the limits passed as `$1` (KiB) and `$2` (CPU seconds), then
/// replaces itself with the remaining arguments. Constant text: nothing
/// user-controlled is ever interpolated into it.
const RLIMIT_PREAMBLE: &str =
    r#"ulimit -v "$1" 2>/dev/null; ulimit -t "$2" 2>/dev/null; shift 2; exec "$@""#;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 8192;

/// How one child process ended.
enum StepOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    Failed(String),
}

struct StepOutput {
    outcome: StepOutcome,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
}

/// Runs executions as native process groups.
#[derive(Debug)]
pub(crate) struct ProcessExecutor {
    grace_period: Duration,
    max_output: usize,
    network: NetworkMode,
    cache: PackageCacheManager,
}

impl ProcessExecutor {
    pub fn new(config: &Config, cache: PackageCacheManager) -> Self {
        warn!(
            "Using the process executor: insecure fallback with no filesystem, syscall or network isolation"
        );
        Self {
            grace_period: config.grace_period(),
            max_output: config.limits.max_output_bytes,
            network: config.network.mode,
            cache,
        }
    }

    fn environment(&self, profile: &LanguageProfile, ctx: &CommandContext<'_>) -> Vec<(String, String)> {
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut env = vec![
            ("PATH".to_string(), path),
            ("HOME".to_string(), ctx.scratch.to_string()),
            ("TMPDIR".to_string(), ctx.scratch.to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        if self.network.is_disabled() {
            env.push(("NO_PROXY".to_string(), "*".to_string()));
            env.push(("no_proxy".to_string(), "*".to_string()));
        }
        env.extend(profile.environment(ctx));
        for mount in self.cache.mounts_for(profile.id) {
            env.extend(mount.host_env());
        }
        env
    }

    /// Spawns one step in a fresh process group and waits for it, the
    /// deadline, or cancellation.
    async fn run_step(
        &self,
        argv: &[String],
        env: &[(String, String)],
        cwd: &Path,
        stdin: Option<&str>,
        deadline: Instant,
        ctl: &ExecutionControl,
    ) -> StepOutput {
        let mut stdout = CappedBuffer::new(self.max_output);
        let mut stderr = CappedBuffer::new(self.max_output);

        let Some((program, args)) = argv.split_first() else {
            return StepOutput {
                outcome: StepOutcome::Failed("empty command".to_string()),
                stdout,
                stderr,
            };
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k, v)))
            .current_dir(cwd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StepOutput {
                    outcome: StepOutcome::Failed(format!("failed to start {program}: {e}")),
                    stdout,
                    stderr,
                }
            }
        };

        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .unwrap_or_default();
        let mut group = GroupGuard { pgid, armed: true };
        ctl.set_unit(IsolationUnit::ProcessGroup { pgid });
        debug!("Started {} in process group {}", program, pgid);

        if let (Some(mut pipe), Some(data)) = (child.stdin.take(), stdin) {
            let data = data.to_string();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(data.as_bytes()).await {
                    debug!("stdin write ended early: {}", e);
                }
                // Dropping the pipe closes the child's stdin
            });
        }

        let stdout_reader = spawn_reader(child.stdout.take(), self.max_output);
        let stderr_reader = spawn_reader(child.stderr.take(), self.max_output);

        let outcome = tokio::select! {
            biased;
            () = ctl.cancel.cancelled() => None,
            () = sleep_until(deadline) => Some(StepOutcome::TimedOut),
            status = child.wait() => Some(match status {
                Ok(status) => StepOutcome::Exited(status),
                Err(e) => StepOutcome::Failed(format!("wait failed: {e}")),
            }),
        };

        let outcome = match outcome {
            Some(StepOutcome::Exited(status)) => {
                // Stragglers left behind by the leader go with it
                let _ = signal_group(pgid, Some(Signal::SIGKILL));
                StepOutcome::Exited(status)
            }
            Some(StepOutcome::Failed(message)) => StepOutcome::Failed(message),
            interrupted => {
                let _ = tokio::join!(terminate_group(pgid, self.grace_period), child.wait());
                interrupted.unwrap_or(StepOutcome::Cancelled)
            }
        };
        group.armed = false;
        ctl.clear_unit();

        // A process that escaped the group may hold the pipes open
        for (reader, buffer) in [(stdout_reader, &mut stdout), (stderr_reader, &mut stderr)] {
            match timeout(self.grace_period, reader).await {
                Ok(Ok(collected)) => *buffer = collected,
                Ok(Err(e)) => warn!("Output reader failed: {}", e),
                Err(_) => warn!("Output reader did not finish; output discarded"),
            }
        }

        StepOutput {
            outcome,
            stdout,
            stderr,
        }
    }
}

/// Drains a pipe into a capped buffer, discarding anything past the cap
/// without blocking the writer.
fn spawn_reader<R>(pipe: Option<R>, limit: usize) -> JoinHandle<CappedBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = CappedBuffer::new(limit);
        let Some(mut pipe) = pipe else {
            return buffer;
        };
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&chunk[..n]),
            }
        }
        buffer
    })
}

/// SIGKILLs a process group when dropped while armed, so a caller that
/// abandons the execute future does not leave the group running.
/// `kill_on_drop` alone reaches only the leader.
struct GroupGuard {
    pgid: i32,
    armed: bool,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed && signal_group(self.pgid, Some(Signal::SIGKILL)).is_ok() {
            debug!("Killed abandoned process group {}", self.pgid);
        }
    }
}

fn signal_group(pgid: i32, signal: Option<Signal>) -> nix::Result<()> {
    // Group 0 or 1 would hit ourselves or init
    if pgid <= 1 {
        return Err(nix::errno::Errno::ESRCH);
    }
    killpg(Pid::from_raw(pgid), signal)
}

/// SIGTERM, wait up to `grace` for the group to disappear, then SIGKILL.
async fn terminate_group(pgid: i32, grace: Duration) {
    if signal_group(pgid, Some(Signal::SIGTERM)).is_err() {
        return;
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        sleep(POLL_INTERVAL).await;
        if signal_group(pgid, None).is_err() {
            debug!("Process group {} exited after SIGTERM", pgid);
            return;
        }
    }

    debug!("Process group {} ignored SIGTERM, sending SIGKILL", pgid);
    let _ = signal_group(pgid, Some(Signal::SIGKILL));
}

/// Copies captured output into the result.
fn record_output(result: &mut ExecutionResult, stdout: CappedBuffer, stderr: CappedBuffer) {
    let (out, out_truncated) = stdout.finish();
    let (err, err_truncated) = stderr.finish();
    result.stdout = out;
    result.stderr = err;
    result.stdout_truncated = out_truncated;
    result.stderr_truncated = err_truncated;
}

/// Moves the result to its terminal state for an interrupted or failed step.
/// Returns false for a normal exit, which the caller classifies.
fn finish_interrupted(result: &mut ExecutionResult, outcome: &StepOutcome, timeout_secs: u64) -> bool {
    match outcome {
        StepOutcome::Cancelled => {
            result.error = Some("Execution killed".to_string());
            result.finish(ExecutionState::Killed, KILLED_EXIT_CODE);
        }
        StepOutcome::TimedOut => {
            result.error = Some(format!("Execution timed out after {timeout_secs}s"));
            result.finish(ExecutionState::Timeout, TIMEOUT_EXIT_CODE);
        }
        StepOutcome::Failed(message) => result.fail(message.clone()),
        StepOutcome::Exited(_) => return false,
    }
    true
}

/// Classifies a normal exit of the run step.
fn classify_exit(result: &mut ExecutionResult, status: ExitStatus) {
    if status.success() {
        result.finish(ExecutionState::Completed, 0);
        return;
    }

    match status.signal() {
        Some(sig) if sig == Signal::SIGKILL as i32 => {
            result.error = Some("Process killed (possible memory limit exceeded)".to_string());
            result.finish(ExecutionState::Killed, KILLED_EXIT_CODE);
        }
        Some(sig) if sig == Signal::SIGXCPU as i32 => {
            result.error = Some("CPU time limit exceeded".to_string());
            result.finish(ExecutionState::Timeout, TIMEOUT_EXIT_CODE);
        }
        Some(sig) => {
            result.error = Some(format!("Terminated by signal {sig}"));
            result.finish(ExecutionState::Failed, 128 + sig);
        }
        None => result.finish(ExecutionState::Failed, status.code().unwrap_or(-1)),
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Process
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            executor: ExecutorKind::Process,
            filesystem_isolation: false,
            network_isolation: false,
            syscall_filtering: false,
            read_only_root: false,
            memory_limit: true,
            cpu_limit: true,
            process_limit: false,
        }
    }

    async fn execute(&self, job: Job<'_>, result: &mut ExecutionResult, ctl: &ExecutionControl) {
        let profile = job.profile;
        let scratch = job.workspace.join("scratch");
        if let Err(e) = std::fs::create_dir(&scratch) {
            result.fail(format!("failed to create scratch space: {e}"));
            return;
        }

        let source = job.workspace.join(&job.source.file_name);
        let source = source.display().to_string();
        let workdir = job.workspace.display().to_string();
        let scratch = scratch.display().to_string();
        let ctx = CommandContext {
            source: &source,
            workdir: &workdir,
            scratch: &scratch,
            entry: &job.source.entry,
        };
        let env = self.environment(profile, &ctx);
        let timeout_secs = profile.timeout.as_secs();

        if let Some(compile) = profile.compile_command(&ctx) {
            let step = self
                .run_step(&compile, &env, job.workspace, None, job.deadline, ctl)
                .await;
            if finish_interrupted(result, &step.outcome, timeout_secs) {
                record_output(result, step.stdout, step.stderr);
                return;
            }
            if let StepOutcome::Exited(status) = step.outcome {
                if !status.success() {
                    let (err, _) = step.stderr.finish();
                    result.compile_error = Some(err.clone());
                    result.stderr = err;
                    result.finish(ExecutionState::Failed, status.code().unwrap_or(-1));
                    return;
                }
            }
        }

        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            RLIMIT_PREAMBLE.to_string(),
            "execbox".to_string(),
            (profile.memory_bytes / 1024).to_string(),
            timeout_secs.max(1).to_string(),
        ];
        argv.extend(profile.run_command(&ctx, job.args));

        let step = self
            .run_step(&argv, &env, job.workspace, job.stdin, job.deadline, ctl)
            .await;
        let interrupted = finish_interrupted(result, &step.outcome, timeout_secs);
        record_output(result, step.stdout, step.stderr);
        if !interrupted {
            if let StepOutcome::Exited(status) = step.outcome {
                classify_exit(result, status);
            }
        }
    }

    async fn terminate(&self, unit: &IsolationUnit) {
        if let IsolationUnit::ProcessGroup { pgid } = unit {
            terminate_group(*pgid, self.grace_period).await;
        }
    }

    async fn reap_orphans(&self, _max_age: Duration) -> Result<u32, SandboxError> {
        // Children die with their `Child` handle; nothing outlives us
        Ok(0)
    }

    async fn close(&self) {
        debug!("Process executor closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::ProfileRegistry;
    use crate::result::ExecutionId;

    fn executor(config: &Config) -> ProcessExecutor {
        let cache = PackageCacheManager::new(std::env::temp_dir(), false);
        ProcessExecutor::new(config, cache)
    }

    async fn run_shell(config: Config, code: &str, stdin: Option<&str>, ctl: &ExecutionControl) -> ExecutionResult {
        let registry = ProfileRegistry::new(&config).unwrap();
        let profile = registry.get("shell").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let source = profile.prepare_source(code);
        std::fs::write(dir.path().join(&source.file_name), &source.contents).unwrap();

        let id = ExecutionId::new();
        let job = Job {
            id,
            profile,
            source: &source,
            workspace: dir.path(),
            stdin,
            args: &[],
            deadline: Instant::now() + profile.timeout,
        };
        let mut result = ExecutionResult::pending(id, profile.id);
        result.mark_running();
        executor(&config).execute(job, &mut result, ctl).await;
        result
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let ctl = ExecutionControl::default();
        let result = run_shell(Config::default(), "echo hello; echo oops >&2", None, &ctl).await;
        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");
        assert!(ctl.unit().is_none());
        assert!(ctl.unit_id().starts_with("pgid:"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let ctl = ExecutionControl::default();
        let result = run_shell(Config::default(), "exit 3", None, &ctl).await;
        assert_eq!(result.state, ExecutionState::Failed);
        assert_eq!(result.exit_code, 3);
        assert!(result.compile_error.is_none());
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let ctl = ExecutionControl::default();
        let result = run_shell(
            Config::default(),
            "read name; echo \"Hello, $name!\"",
            Some("Claude\n"),
            &ctl,
        )
        .await;
        assert_eq!(result.state, ExecutionState::Completed);
        assert!(result.stdout.contains("Hello, Claude!"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let mut config = Config::default();
        config.limits.max_output_bytes = 10;
        let ctl = ExecutionControl::default();
        let result = run_shell(config, "i=0; while [ $i -lt 100 ]; do echo line; i=$((i+1)); done", None, &ctl).await;
        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.stdout.len(), 10);
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let mut config = Config::default();
        config.limits.timeout_secs = 1;
        config.executor.grace_period_ms = 200;
        let ctl = ExecutionControl::default();
        let started = std::time::Instant::now();
        let result = run_shell(config, "echo before; sleep 30", None, &ctl).await;

        assert_eq!(result.state, ExecutionState::Timeout);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout, "before\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_kills_group() {
        let ctl = ExecutionControl::default();
        let canceller = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(300)).await;
                ctl.cancel.cancel();
            })
        };
        let result = run_shell(Config::default(), "sleep 30 & sleep 30", None, &ctl).await;
        canceller.await.unwrap();

        assert_eq!(result.state, ExecutionState::Killed);
        assert!(result.killed);
        assert_eq!(result.exit_code, KILLED_EXIT_CODE);
    }

    #[test]
    fn test_classify_signals() {
        let running = || {
            let mut result = ExecutionResult::pending(ExecutionId::new(), "c");
            result.mark_running();
            result
        };

        let mut killed = running();
        classify_exit(&mut killed, ExitStatus::from_raw(Signal::SIGKILL as i32));
        assert_eq!(killed.state, ExecutionState::Killed);
        assert!(killed.error.unwrap().contains("memory"));

        let mut cpu = running();
        classify_exit(&mut cpu, ExitStatus::from_raw(Signal::SIGXCPU as i32));
        assert_eq!(cpu.state, ExecutionState::Timeout);

        let mut segv = running();
        classify_exit(&mut segv, ExitStatus::from_raw(Signal::SIGSEGV as i32));
        assert_eq!(segv.state, ExecutionState::Failed);
        assert_eq!(segv.exit_code, 128 + Signal::SIGSEGV as i32);

        let mut exited = running();
        classify_exit(&mut exited, ExitStatus::from_raw(2 << 8));
        assert_eq!(exited.state, ExecutionState::Failed);
        assert_eq!(exited.exit_code, 2);
    }

    #[tokio::test]
    async fn test_dropped_step_kills_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let argv = vec!["sh".to_string(), "-c".to_string(), script];
        let exec = executor(&Config::default());
        let env = vec![("PATH".to_string(), DEFAULT_PATH.to_string())];
        let ctl = ExecutionControl::default();

        let step = exec.run_step(&argv, &env, dir.path(), None, Instant::now() + Duration::from_secs(30), &ctl);
        assert!(timeout(Duration::from_millis(500), step).await.is_err());
        // Abandoned mid-step, so the unit was never cleared
        assert!(ctl.unit().is_some());

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        for _ in 0..100 {
            if !process_alive(pid) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("background process {pid} outlived the dropped step");
    }

    fn process_alive(pid: i32) -> bool {
        // Zombies waiting for init to reap them count as gone
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat.rsplit(") ").next().is_some_and(|rest| rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[test]
    fn test_signal_group_refuses_own_group() {
        assert!(signal_group(0, None).is_err());
        assert!(signal_group(1, None).is_err());
    }
}
