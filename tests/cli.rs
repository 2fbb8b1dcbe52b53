//! Integration tests for the execbox CLI.
//!
//! These tests verify the CLI binary behavior by running the actual executable
//! and checking output and exit codes. Executions use the process executor
//! so no container engine is needed.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the execbox binary.
#[allow(deprecated)]
fn execbox() -> Command {
    Command::cargo_bin("execbox").expect("failed to find execbox binary")
}

/// Creates a Command running in `dir` with the process executor and a
/// workspace root inside `dir`.
fn execbox_in(dir: &TempDir) -> Command {
    let mut cmd = execbox();
    cmd.current_dir(dir.path())
        .env("EXECBOX_WORKSPACE_ROOT", dir.path().join("workspaces"))
        .args(["--executor", "process"]);
    cmd
}

// -----------------------------------------------------------------------------
// Help and version tests
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    execbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("execbox"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("languages"))
        .stdout(predicate::str::contains("seccomp"))
        .stdout(predicate::str::contains("images"));
}

#[test]
fn test_version_shows_version() {
    execbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("execbox"));
}

#[test]
fn test_exec_help_shows_options() {
    execbox()
        .args(["exec", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--language"))
        .stdout(predicate::str::contains("--code"))
        .stdout(predicate::str::contains("--stdin"))
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn test_unknown_executor_is_rejected() {
    execbox()
        .args(["--executor", "vm", "languages"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown executor mode"));
}

// -----------------------------------------------------------------------------
// Introspection commands
// -----------------------------------------------------------------------------

#[test]
fn test_seccomp_prints_policy() {
    execbox()
        .arg("seccomp")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"defaultAction\": \"SCMP_ACT_ERRNO\""))
        .stdout(predicate::str::contains("\"syscalls\""));
}

#[test]
fn test_languages_lists_profiles() {
    let dir = TempDir::new().unwrap();
    execbox_in(&dir)
        .arg("languages")
        .assert()
        .success()
        .stdout(predicate::str::contains("python"))
        .stdout(predicate::str::contains("javascript"))
        .stdout(predicate::str::contains("shell"));
}

#[test]
fn test_languages_honours_config_overrides() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("execbox.toml"),
        "[languages.python]\ntimeout_secs = 3\n",
    )
    .unwrap();

    execbox_in(&dir)
        .args(["languages", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"timeout_secs\": 3"));
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("execbox.toml"), "[limits\n").unwrap();

    execbox_in(&dir)
        .arg("languages")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

// -----------------------------------------------------------------------------
// Execution commands
// -----------------------------------------------------------------------------

#[test]
fn test_exec_shell_snippet() {
    let dir = TempDir::new().unwrap();
    execbox_in(&dir)
        .args(["exec", "--language", "shell", "--code", "echo hello"])
        .assert()
        .success()
        .stdout("hello\n")
        .stderr(predicate::str::contains("completed"));
}

#[test]
fn test_exec_propagates_exit_code() {
    let dir = TempDir::new().unwrap();
    execbox_in(&dir)
        .args(["exec", "-l", "sh", "--code", "exit 7"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("failed"));
}

#[test]
fn test_exec_json_output() {
    let dir = TempDir::new().unwrap();
    execbox_in(&dir)
        .args([
            "exec",
            "--language",
            "shell",
            "--code",
            "cat",
            "--stdin",
            "piped",
            "--json",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"completed\""))
        .stdout(predicate::str::contains("\"stdout\": \"piped\""));
}

#[test]
fn test_exec_requires_code() {
    let dir = TempDir::new().unwrap();
    execbox_in(&dir)
        .args(["exec", "--language", "shell"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--code"));
}

#[test]
fn test_run_unknown_extension_fails() {
    let dir = TempDir::new().unwrap();
    execbox_in(&dir)
        .args(["run", "foo.xyz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed"))
        .stderr(predicate::str::contains("Unsupported file type"));
}

#[test]
fn test_run_script_with_arguments() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("args.sh"), "echo \"$#:$1\"\n").unwrap();

    execbox_in(&dir)
        .args(["run", "args.sh", "--", "one two", "three"])
        .assert()
        .success()
        .stdout("2:one two\n");
}
