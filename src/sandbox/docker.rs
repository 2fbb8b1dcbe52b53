//! Container executor: one single-use, locked-down container per execution.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig,
    CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, info, warn};

use super::executor::{
    Capabilities, CappedBuffer, ExecutionControl, Executor, IsolationUnit, Job,
    KILLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use super::image::{self, SANDBOX_USER};
use super::registry::SharedMap;
use super::{NetworkMode, SandboxError};
use crate::cache::PackageCacheManager;
use crate::config::{Config, SecurityConfig};
use crate::language::{CommandContext, LanguageProfile, ProfileRegistry};
use crate::result::{ExecutionResult, ExecutionState, ExecutorKind};
use crate::seccomp::SeccompHandle;

const CONTAINER_PREFIX: &str = "execbox";
const MANAGED_LABEL: &str = "execbox.managed";
const EXECUTION_LABEL: &str = "execbox.execution-id";

const WORKDIR: &str = "/work";
const SCRATCH: &str = "/tmp";

/// Exit status the compile wrapper uses when the compile step fails.
const COMPILE_FAILED_EXIT: i64 = 213;
/// Last stdout line the compile wrapper prints before exiting with
/// `COMPILE_FAILED_EXIT`. A program exiting 213 on its own lacks it.
const COMPILE_FAILED_MARKER: &str = "execbox: compile step failed";

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to the container engine and checks that it answers.
pub(crate) async fn connect(socket: Option<&str>) -> Result<Docker, SandboxError> {
    let docker = match socket {
        Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION),
        None => Docker::connect_with_local_defaults(),
    }
    .map_err(|e| SandboxError::engine_unavailable(e.to_string()))?;

    match timeout(PING_TIMEOUT, docker.ping()).await {
        Ok(Ok(_)) => Ok(docker),
        Ok(Err(e)) => Err(SandboxError::engine_unavailable(e.to_string())),
        Err(_) => Err(SandboxError::engine_unavailable("ping timed out")),
    }
}

/// Runs executions in containers.
#[derive(Debug)]
pub(crate) struct ContainerExecutor {
    docker: Docker,
    image_prefix: String,
    security: SecurityConfig,
    network: NetworkMode,
    grace_period: Duration,
    max_output: usize,
    seccomp: Option<SeccompHandle>,
    cache: PackageCacheManager,
    /// Language id -> image known to be available
    images: SharedMap<&'static str, String>,
}

impl ContainerExecutor {
    /// Builds the executor and checks which hardened images exist, building
    /// missing ones when configured to. Image trouble is never fatal.
    pub async fn new(
        docker: Docker,
        config: &Config,
        profiles: &ProfileRegistry,
        seccomp: Option<SeccompHandle>,
        cache: PackageCacheManager,
    ) -> Self {
        let executor = Self {
            docker,
            image_prefix: config.engine.image_prefix.clone(),
            security: config.security.clone(),
            network: config.network.mode,
            grace_period: config.grace_period(),
            max_output: config.limits.max_output_bytes,
            seccomp,
            cache,
            images: SharedMap::default(),
        };

        executor
            .discover_images(profiles, config.engine.build_images)
            .await;
        executor
    }

    async fn discover_images(&self, profiles: &ProfileRegistry, build_missing: bool) {
        for profile in profiles.list() {
            let hardened = profile.hardened_image(&self.image_prefix);

            match image::image_exists(&self.docker, &hardened).await {
                Ok(true) => {
                    self.images.insert(profile.id, hardened);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Could not inspect image {}: {}", hardened, e);
                    continue;
                }
            }

            if build_missing {
                match image::build_hardened_image(&self.docker, profile, &hardened).await {
                    Ok(()) => {
                        self.images.insert(profile.id, hardened);
                    }
                    Err(e) => warn!("Could not build sandbox image for {}: {}", profile.id, e),
                }
            }
        }

        info!(
            "Container executor ready ({} hardened images available)",
            self.images.len()
        );
    }

    /// Hardened image when available, otherwise the public base image.
    fn resolve_image(&self, profile: &LanguageProfile) -> String {
        if let Some(image) = self.images.get(&profile.id) {
            return image;
        }
        warn!(
            "Hardened image for {} not available, using {}",
            profile.id,
            profile.fallback_image()
        );
        profile.fallback_image().to_string()
    }

    fn container_config(&self, job: &Job<'_>, image: String) -> ContainerConfig<String> {
        let profile = job.profile;
        let source = format!("{WORKDIR}/{}", job.source.file_name);
        let ctx = CommandContext {
            source: &source,
            workdir: WORKDIR,
            scratch: SCRATCH,
            entry: &job.source.entry,
        };

        let cmd = container_command(profile, &ctx, job.args);

        let mut env = vec![
            ("HOME".to_string(), SCRATCH.to_string()),
            ("TMPDIR".to_string(), SCRATCH.to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        for (key, value) in profile.environment(&ctx) {
            set_env(&mut env, key, value);
        }

        let mut binds = vec![format!("{}:{WORKDIR}:ro", job.workspace.display())];
        for mount in self.cache.mounts_for(profile.id) {
            binds.push(mount.bind());
            for (key, value) in mount.env {
                set_env(&mut env, key, value);
            }
        }

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (EXECUTION_LABEL.to_string(), job.id.to_string()),
        ]);

        ContainerConfig {
            image: Some(image),
            cmd: Some(cmd),
            env: Some(env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()),
            working_dir: Some(WORKDIR.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(self.network.is_disabled()),
            labels: Some(labels),
            host_config: Some(self.host_config(profile, binds)),
            ..Default::default()
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn host_config(&self, profile: &LanguageProfile, binds: Vec<String>) -> HostConfig {
        let memory = i64::try_from(profile.memory_bytes).unwrap_or(i64::MAX);

        let mut security_opt = Vec::new();
        if self.security.no_new_privileges {
            security_opt.push("no-new-privileges".to_string());
        }
        if let Some(seccomp) = &self.seccomp {
            security_opt.push(format!("seccomp={}", seccomp.json()));
        }
        if self.security.apparmor && cfg!(target_os = "linux") {
            security_opt.push("apparmor=docker-default".to_string());
        }

        let exec = if profile.exec_scratch() { "exec" } else { "noexec" };
        let tmpfs = HashMap::from([(
            SCRATCH.to_string(),
            format!(
                "rw,{exec},nosuid,nodev,size={},mode=1777",
                profile.scratch_bytes
            ),
        )]);

        HostConfig {
            memory: Some(memory),
            // Equal to memory: no swap on top
            memory_swap: Some(memory),
            nano_cpus: Some((profile.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(profile.pids),
            cap_drop: self
                .security
                .drop_capabilities
                .then(|| vec!["ALL".to_string()]),
            security_opt: Some(security_opt),
            readonly_rootfs: Some(self.security.read_only_root),
            tmpfs: Some(tmpfs),
            network_mode: Some(self.network.to_string()),
            binds: Some(binds),
            ..Default::default()
        }
    }

    async fn create(&self, name: &str, config: ContainerConfig<String>) -> Result<(), SandboxError> {
        let options = || {
            Some(CreateContainerOptions {
                name: name.to_string(),
                platform: None,
            })
        };

        match self.docker.create_container(options(), config.clone()).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // Public base image not present yet; pull once and retry
                let image = config.image.clone().unwrap_or_default();
                image::pull_image(&self.docker, &image).await?;
                self.docker
                    .create_container(options(), config)
                    .await
                    .map(|_| ())
                    .map_err(|e| SandboxError::container_failed(e.to_string()))
            }
            Err(e) => Err(SandboxError::container_failed(e.to_string())),
        }
    }

    /// Attaches, starts, feeds stdin and drains output until the container
    /// exits. Returns the exit status.
    async fn run(
        &self,
        name: &str,
        stdin: Option<&str>,
        stdout: &mut CappedBuffer,
        stderr: &mut CappedBuffer,
    ) -> Result<i64, SandboxError> {
        let AttachContainerResults {
            mut output,
            mut input,
        } = self
            .docker
            .attach_container(
                name,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await
            .map_err(|e| SandboxError::container_failed(format!("attach failed: {e}")))?;

        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| SandboxError::container_failed(format!("start failed: {e}")))?;

        let feed = async {
            if let Some(data) = stdin {
                if let Err(e) = input.write_all(data.as_bytes()).await {
                    debug!("stdin write ended early: {}", e);
                }
            }
            let _ = input.shutdown().await;
        };

        let drain = async {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        stdout.push(&message);
                    }
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        warn!("Error reading container output: {}", e);
                        break;
                    }
                }
            }
        };

        tokio::join!(feed, drain);

        let mut wait = self.docker.wait_container(
            name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::container_failed(format!("wait failed: {e}"))),
            None => Err(SandboxError::container_failed("wait returned no status")),
        }
    }

    async fn remove(&self, name: &str) {
        let removal = self.docker.remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        );

        match timeout(REMOVE_TIMEOUT, removal).await {
            Ok(Ok(())) => debug!("Removed container {}", name),
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => {}
            Ok(Err(e)) => warn!("Failed to remove container {}: {}", name, e),
            Err(_) => warn!("Timed out removing container {}", name),
        }
    }
}

/// Interpreted languages run their argv directly. Compiled languages run a
/// fixed `sh -c` line with every argument quoted.
fn container_command(
    profile: &LanguageProfile,
    ctx: &CommandContext<'_>,
    args: &[String],
) -> Vec<String> {
    let run = profile.run_command(ctx, args);
    match profile.compile_command(ctx) {
        None => run,
        Some(compile) => vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "{} || {{ echo {}; exit {COMPILE_FAILED_EXIT}; }}; exec {}",
                shell_words::join(&compile),
                shell_words::quote(COMPILE_FAILED_MARKER),
                shell_words::join(&run)
            ),
        ],
    }
}

/// Detects the compile wrapper's failure branch and strips its marker from
/// stdout.
fn take_compile_failure(status: i64, stdout: &mut String) -> bool {
    if status != COMPILE_FAILED_EXIT {
        return false;
    }
    let text = stdout.as_str();
    let text = text.strip_suffix('\n').unwrap_or(text);
    let Some(rest) = text.strip_suffix(COMPILE_FAILED_MARKER) else {
        return false;
    };
    if !(rest.is_empty() || rest.ends_with('\n')) {
        return false;
    }
    let len = rest.len();
    stdout.truncate(len);
    true
}

/// Moves the result to the terminal state matching how the container ended.
fn record_outcome(result: &mut ExecutionResult, outcome: Outcome, profile: &LanguageProfile) {
    match outcome {
        Outcome::Cancelled => {
            result.error = Some("Execution killed".to_string());
            result.finish(ExecutionState::Killed, KILLED_EXIT_CODE);
        }
        Outcome::TimedOut => {
            result.error = Some(format!(
                "Execution timed out after {}s",
                profile.timeout.as_secs()
            ));
            result.finish(ExecutionState::Timeout, TIMEOUT_EXIT_CODE);
        }
        Outcome::Exited(Ok(0)) => result.finish(ExecutionState::Completed, 0),
        Outcome::Exited(Ok(status)) => {
            if profile.is_compiled() && take_compile_failure(status, &mut result.stdout) {
                result.compile_error = Some(result.stderr.clone());
            }
            result.finish(ExecutionState::Failed, i32::try_from(status).unwrap_or(-1));
        }
        Outcome::Exited(Err(e)) => result.fail(e.to_string()),
    }
}

fn set_env(env: &mut Vec<(String, String)>, key: String, value: String) {
    match env.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = value,
        None => env.push((key, value)),
    }
}

enum Outcome {
    Cancelled,
    TimedOut,
    Exited(Result<i64, SandboxError>),
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Container
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            executor: ExecutorKind::Container,
            filesystem_isolation: true,
            network_isolation: self.network.is_disabled(),
            syscall_filtering: self.seccomp.is_some(),
            read_only_root: self.security.read_only_root,
            memory_limit: true,
            cpu_limit: true,
            process_limit: true,
        }
    }

    async fn execute(&self, job: Job<'_>, result: &mut ExecutionResult, ctl: &ExecutionControl) {
        let name = format!("{CONTAINER_PREFIX}-{}", job.id.short());
        let image = self.resolve_image(job.profile);
        let config = self.container_config(&job, image);

        debug!("Creating container: {}", name);
        // Creation may pull a public image; the deadline and kill bound it too
        let interrupted = tokio::select! {
            biased;
            () = ctl.cancel.cancelled() => Some(Outcome::Cancelled),
            () = sleep_until(job.deadline) => Some(Outcome::TimedOut),
            created = self.create(&name, config) => created.err().map(|e| Outcome::Exited(Err(e))),
        };
        if let Some(outcome) = interrupted {
            // An abandoned create request may still have produced the container
            self.remove(&name).await;
            record_outcome(result, outcome, job.profile);
            return;
        }
        let unit = IsolationUnit::Container { name: name.clone() };
        ctl.set_unit(unit.clone());

        let mut stdout = CappedBuffer::new(self.max_output);
        let mut stderr = CappedBuffer::new(self.max_output);

        let outcome = tokio::select! {
            biased;
            () = ctl.cancel.cancelled() => Outcome::Cancelled,
            () = sleep_until(job.deadline) => Outcome::TimedOut,
            status = self.run(&name, job.stdin, &mut stdout, &mut stderr) => Outcome::Exited(status),
        };

        if matches!(outcome, Outcome::Cancelled | Outcome::TimedOut) {
            self.terminate(&unit).await;
        } else {
            self.remove(&name).await;
        }
        ctl.clear_unit();

        let (out, out_truncated) = stdout.finish();
        let (err, err_truncated) = stderr.finish();
        result.stdout = out;
        result.stderr = err;
        result.stdout_truncated = out_truncated;
        result.stderr_truncated = err_truncated;

        record_outcome(result, outcome, job.profile);
    }

    async fn terminate(&self, unit: &IsolationUnit) {
        let IsolationUnit::Container { name } = unit else {
            return;
        };

        let grace_secs = i64::try_from(self.grace_period.as_secs().max(1)).unwrap_or(i64::MAX);
        let stop = self.docker.stop_container(
            name,
            Some(StopContainerOptions { t: grace_secs }),
        );

        // The stop call itself may hang on a wedged engine; removal follows
        // regardless of how it ends.
        match timeout(self.grace_period + PING_TIMEOUT, stop).await {
            Ok(Ok(())) => debug!("Stopped container {}", name),
            Ok(Err(e)) => debug!("Stop of {} failed: {}", name, e),
            Err(_) => warn!("Timed out stopping container {}", name),
        }

        self.remove(name).await;
    }

    async fn reap_orphans(&self, max_age: Duration) -> Result<u32, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::container_failed(format!("list failed: {e}")))?;

        let cutoff = chrono::Utc::now().timestamp()
            - i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let mut reaped = 0;

        for container in containers {
            if container.created.unwrap_or(i64::MAX) >= cutoff {
                continue;
            }
            let Some(name) = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
            else {
                continue;
            };

            info!("Reaping orphaned container {}", name);
            self.terminate(&IsolationUnit::Container { name }).await;
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn close(&self) {
        debug!("Container executor closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::PreparedSource;
    use crate::sandbox::workspace::WorkspaceManager;
    use std::path::Path;
    use tokio::time::Instant;

    fn registry() -> ProfileRegistry {
        ProfileRegistry::new(&Config::default()).unwrap()
    }

    fn ctx(entry: &str) -> CommandContext<'_> {
        CommandContext {
            source: "/work/main.c",
            workdir: WORKDIR,
            scratch: SCRATCH,
            entry,
        }
    }

    #[test]
    fn test_interpreted_command_is_plain_argv() {
        let registry = registry();
        let python = registry.get("python").unwrap();
        let cmd = container_command(python, &ctx(""), &["x y".to_string()]);
        assert_eq!(cmd, ["python3", "-u", "/work/main.c", "x y"]);
    }

    #[test]
    fn test_compiled_command_quotes_arguments() {
        let registry = registry();
        let c = registry.get("c").unwrap();
        let cmd = container_command(c, &ctx(""), &["a b".to_string(), "$(rm -rf /)".to_string()]);
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        assert_eq!(
            cmd[2],
            "gcc -O2 -o /tmp/main /work/main.c -lm || { echo 'execbox: compile step failed'; exit 213; }; exec /tmp/main 'a b' '$(rm -rf /)'"
        );
    }

    #[test]
    fn test_compile_failure_needs_marker() {
        let mut wrapped = format!("{COMPILE_FAILED_MARKER}\n");
        assert!(take_compile_failure(213, &mut wrapped));
        assert!(wrapped.is_empty());

        let mut with_output = format!("cc1 note\n{COMPILE_FAILED_MARKER}\n");
        assert!(take_compile_failure(213, &mut with_output));
        assert_eq!(with_output, "cc1 note\n");

        // The program itself exiting 213
        let mut program = "result: 1\n".to_string();
        assert!(!take_compile_failure(213, &mut program));
        assert_eq!(program, "result: 1\n");

        let mut other_status = format!("{COMPILE_FAILED_MARKER}\n");
        assert!(!take_compile_failure(1, &mut other_status));

        let mut glued = format!("x{COMPILE_FAILED_MARKER}\n");
        assert!(!take_compile_failure(213, &mut glued));
    }

    #[test]
    fn test_program_exit_213_is_not_compile_error() {
        let registry = registry();
        let c = registry.get("c").unwrap();
        let running = || {
            let mut result = ExecutionResult::pending(crate::result::ExecutionId::new(), "c");
            result.mark_running();
            result
        };

        let mut program = running();
        program.stdout = "done\n".to_string();
        program.stderr = "bye\n".to_string();
        record_outcome(&mut program, Outcome::Exited(Ok(213)), c);
        assert_eq!(program.state, ExecutionState::Failed);
        assert_eq!(program.exit_code, 213);
        assert!(program.compile_error.is_none());

        let mut compile = running();
        compile.stdout = format!("{COMPILE_FAILED_MARKER}\n");
        compile.stderr = "main.c:1: error: expected expression\n".to_string();
        record_outcome(&mut compile, Outcome::Exited(Ok(213)), c);
        assert_eq!(compile.compile_error.as_deref(), Some("main.c:1: error: expected expression\n"));
        assert!(compile.stdout.is_empty());
    }

    #[test]
    fn test_interrupted_outcomes_are_terminal() {
        let registry = registry();
        let python = registry.get("python").unwrap();
        let running = || {
            let mut result = ExecutionResult::pending(crate::result::ExecutionId::new(), "python");
            result.mark_running();
            result
        };

        let mut killed = running();
        record_outcome(&mut killed, Outcome::Cancelled, python);
        assert!(killed.killed);
        assert_eq!(killed.exit_code, KILLED_EXIT_CODE);

        let mut timed_out = running();
        record_outcome(&mut timed_out, Outcome::TimedOut, python);
        assert!(timed_out.timed_out);
        assert_eq!(timed_out.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn test_set_env_overrides() {
        let mut env = vec![("GOCACHE".to_string(), "/tmp/go-cache".to_string())];
        set_env(&mut env, "GOCACHE".to_string(), "/cache/go-build".to_string());
        set_env(&mut env, "HOME".to_string(), "/tmp".to_string());
        assert_eq!(
            env,
            vec![
                ("GOCACHE".to_string(), "/cache/go-build".to_string()),
                ("HOME".to_string(), "/tmp".to_string()),
            ]
        );
    }

    async fn executor_or_skip(config: &Config) -> Option<ContainerExecutor> {
        // Docker not available - test passes
        let docker = connect(None).await.ok()?;
        let dir = tempfile::tempdir().ok()?;
        let cache = PackageCacheManager::new(dir.path().to_path_buf(), false);
        Some(ContainerExecutor::new(docker, config, &registry(), None, cache).await)
    }

    #[tokio::test]
    async fn test_container_config_is_locked_down() {
        let config = Config::default();
        let Some(executor) = executor_or_skip(&config).await else {
            return;
        };
        let registry = registry();
        let profile = registry.get("go").unwrap();
        let source = PreparedSource {
            file_name: "main.go".to_string(),
            contents: String::new(),
            entry: String::new(),
        };
        let job = Job {
            id: crate::result::ExecutionId::new(),
            profile,
            source: &source,
            workspace: Path::new("/tmp/exec-test"),
            stdin: None,
            args: &[],
            deadline: Instant::now(),
        };

        let container = executor.container_config(&job, "golang:1.22".to_string());
        let host = container.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.pids_limit, Some(100));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert!(host.tmpfs.unwrap()["/tmp"].contains(",exec,"));
        assert_eq!(host.binds.unwrap()[0], "/tmp/exec-test:/work:ro");
        assert!(host
            .security_opt
            .unwrap()
            .contains(&"no-new-privileges".to_string()));
        assert_eq!(container.user.as_deref(), Some(SANDBOX_USER));
        assert_eq!(container.network_disabled, Some(true));
        assert_eq!(container.labels.unwrap()[MANAGED_LABEL], "true");
    }

    fn running_result(profile: &LanguageProfile) -> ExecutionResult {
        let mut result = ExecutionResult::pending(crate::result::ExecutionId::new(), profile.id);
        result.mark_running();
        result
    }

    #[tokio::test]
    async fn test_create_is_bounded_by_kill_and_deadline() {
        // An engine that never answers: anything that reached it would fail
        // rather than be killed or time out
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("no-engine.sock").display().to_string();
        let Ok(docker) = Docker::connect_with_unix(&socket, 120, bollard::API_DEFAULT_VERSION) else {
            return;
        };
        let config = Config::default();
        let cache = PackageCacheManager::new(dir.path().to_path_buf(), false);
        let executor = ContainerExecutor::new(docker, &config, &registry(), None, cache).await;

        let registry = registry();
        let profile = registry.get("python").unwrap();
        let source = profile.prepare_source("print(1)");
        let job = |deadline| Job {
            id: crate::result::ExecutionId::new(),
            profile,
            source: &source,
            workspace: dir.path(),
            stdin: None,
            args: &[],
            deadline,
        };

        let ctl = ExecutionControl::default();
        ctl.cancel.cancel();
        let mut killed = running_result(profile);
        executor
            .execute(job(Instant::now() + Duration::from_secs(30)), &mut killed, &ctl)
            .await;
        assert_eq!(killed.state, ExecutionState::Killed);
        assert!(ctl.unit().is_none());

        let ctl = ExecutionControl::default();
        let mut timed_out = running_result(profile);
        executor.execute(job(Instant::now()), &mut timed_out, &ctl).await;
        assert_eq!(timed_out.state, ExecutionState::Timeout);
        assert_eq!(timed_out.exit_code, TIMEOUT_EXIT_CODE);
    }

    /// Runs a shell snippet in a real container. `None` when no engine
    /// answers or the base image cannot be pulled.
    async fn run_shell_in_container(code: &str) -> Option<ExecutionResult> {
        let config = Config::default();
        let executor = executor_or_skip(&config).await?;
        let registry = registry();
        let profile = registry.get("shell").unwrap();
        if image::pull_image(&executor.docker, profile.fallback_image()).await.is_err() {
            return None;
        }

        let root = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceManager::new(root.path().join("workspaces"), Duration::ZERO).unwrap();
        let id = crate::result::ExecutionId::new();
        let workspace = workspaces.create(id).unwrap();
        let source = profile.prepare_source(code);
        workspace.write_source(&source).unwrap();

        let job = Job {
            id,
            profile,
            source: &source,
            workspace: workspace.path(),
            stdin: None,
            args: &[],
            deadline: Instant::now() + profile.timeout,
        };
        let mut result = running_result(profile);
        executor
            .execute(job, &mut result, &ExecutionControl::default())
            .await;
        Some(result)
    }

    #[tokio::test]
    async fn test_container_has_no_network() {
        let Some(result) = run_shell_in_container("ls /sys/class/net").await else {
            return;
        };
        assert_eq!(result.state, ExecutionState::Completed, "{result:?}");
        // Loopback only: no route out
        assert_eq!(result.stdout.split_whitespace().collect::<Vec<_>>(), ["lo"]);
    }

    #[tokio::test]
    async fn test_container_root_and_workspace_are_read_only() {
        let code = "touch /escape 2>/dev/null && echo root-writable\n\
                    touch /work/escape 2>/dev/null && echo work-writable\n\
                    touch /tmp/scratch && echo tmp-ok\n";
        let Some(result) = run_shell_in_container(code).await else {
            return;
        };
        assert_eq!(result.state, ExecutionState::Completed, "{result:?}");
        assert_eq!(result.stdout, "tmp-ok\n");
    }
}
