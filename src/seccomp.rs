//! Seccomp policy generation.
//!
//! The policy is default-deny. It allows what interpreters, compilers and
//! linkers need and explicitly denies host-level mutation and privilege
//! escalation. `ptrace` is denied outright.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::sandbox::SandboxError;

const PROFILE_FILE: &str = "seccomp-profile.json";

/// Action applied to a matching syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeccompAction {
    #[serde(rename = "SCMP_ACT_ALLOW")]
    Allow,
    #[serde(rename = "SCMP_ACT_ERRNO")]
    Errno,
}

/// Comparison used by an argument predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    #[serde(rename = "SCMP_CMP_EQ")]
    Equal,
    #[serde(rename = "SCMP_CMP_NE")]
    NotEqual,
}

/// Condition on one syscall argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallArg {
    pub index: u32,
    pub value: u64,
    pub op: CompareOp,
}

/// A group of syscalls bound to one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallRule {
    pub names: Vec<&'static str>,
    pub action: SeccompAction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<SyscallArg>,
}

/// Seccomp policy document in the container engine's JSON format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeccompPolicy {
    pub default_action: SeccompAction,
    pub architectures: Vec<&'static str>,
    pub syscalls: Vec<SyscallRule>,
}

const ARCHITECTURES: &[&str] = &[
    "SCMP_ARCH_X86_64",
    "SCMP_ARCH_X86",
    "SCMP_ARCH_AARCH64",
    "SCMP_ARCH_ARM",
];

const FILE_IO: &[&str] = &[
    "read", "write", "open", "openat", "openat2", "close", "close_range", "creat",
    "stat", "fstat", "lstat", "newfstatat", "statx", "statfs", "fstatfs",
    "lseek", "pread64", "pwrite64", "readv", "writev", "preadv", "pwritev",
    "preadv2", "pwritev2", "sendfile", "copy_file_range", "splice", "tee",
    "access", "faccessat", "faccessat2", "readlink", "readlinkat",
    "getdents", "getdents64", "getcwd", "chdir", "fchdir",
    "rename", "renameat", "renameat2", "mkdir", "mkdirat", "rmdir",
    "link", "linkat", "unlink", "unlinkat", "symlink", "symlinkat",
    "chmod", "fchmod", "fchmodat", "chown", "fchown", "fchownat", "lchown",
    "umask", "truncate", "ftruncate", "fallocate", "fadvise64", "readahead",
    "flock", "fsync", "fdatasync", "sync_file_range", "syncfs",
    "utime", "utimes", "utimensat", "futimesat",
    "getxattr", "lgetxattr", "fgetxattr", "listxattr", "llistxattr", "flistxattr",
    "fcntl", "ioctl", "dup", "dup2", "dup3", "pipe", "pipe2",
    "inotify_init", "inotify_init1", "inotify_add_watch", "inotify_rm_watch",
    "mknod", "mknodat",
];

const MEMORY: &[&str] = &[
    "mmap", "mprotect", "munmap", "mremap", "brk", "madvise", "msync", "mincore",
    "mlock", "mlock2", "munlock", "mlockall", "munlockall", "membarrier",
    "memfd_create", "mbind", "set_mempolicy", "get_mempolicy",
    "shmget", "shmat", "shmdt", "shmctl",
];

const SIGNALS: &[&str] = &[
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "rt_sigpending",
    "rt_sigtimedwait", "rt_sigqueueinfo", "rt_tgsigqueueinfo", "rt_sigsuspend",
    "sigaltstack", "signalfd", "signalfd4", "kill", "tkill", "tgkill", "pause",
    "restart_syscall",
];

const EVENTS: &[&str] = &[
    "poll", "ppoll", "select", "pselect6", "epoll_create", "epoll_create1",
    "epoll_ctl", "epoll_wait", "epoll_pwait", "epoll_pwait2",
    "eventfd", "eventfd2", "timerfd_create", "timerfd_settime", "timerfd_gettime",
    "io_setup", "io_destroy", "io_getevents", "io_pgetevents", "io_submit", "io_cancel",
];

const SOCKETS: &[&str] = &[
    "socket", "socketpair", "connect", "accept", "accept4", "bind", "listen",
    "sendto", "recvfrom", "sendmsg", "recvmsg", "sendmmsg", "recvmmsg",
    "shutdown", "getsockname", "getpeername", "setsockopt", "getsockopt",
];

const PROCESS: &[&str] = &[
    "clone", "clone3", "fork", "vfork", "execve", "execveat", "exit", "exit_group",
    "wait4", "waitid", "pidfd_open", "pidfd_send_signal",
    "getpid", "getppid", "gettid", "getpgid", "getpgrp", "setpgid", "getsid", "setsid",
    "getuid", "getgid", "geteuid", "getegid", "getgroups",
    "getresuid", "getresgid", "setuid", "setgid", "setreuid", "setregid",
    "setresuid", "setresgid", "setgroups", "setfsuid", "setfsgid",
    "capget", "capset", "prctl", "arch_prctl", "set_tid_address",
    "set_robust_list", "get_robust_list", "rseq", "futex", "futex_waitv",
    "set_thread_area", "get_thread_area", "uname", "sysinfo", "getrandom",
    "getrlimit", "setrlimit", "prlimit64", "getrusage", "times", "getcpu",
    "getpriority", "setpriority", "ioprio_get", "ioprio_set", "seccomp",
    "semget", "semop", "semctl", "semtimedop",
    "msgget", "msgsnd", "msgrcv", "msgctl",
    "mq_open", "mq_unlink", "mq_timedsend", "mq_timedreceive", "mq_notify",
    "mq_getsetattr",
];

const SCHEDULING: &[&str] = &[
    "sched_yield", "sched_setparam", "sched_getparam", "sched_setscheduler",
    "sched_getscheduler", "sched_get_priority_max", "sched_get_priority_min",
    "sched_rr_get_interval", "sched_setaffinity", "sched_getaffinity",
    "sched_setattr", "sched_getattr",
];

const TIME: &[&str] = &[
    "nanosleep", "clock_nanosleep", "clock_gettime", "clock_getres",
    "gettimeofday", "time", "alarm", "getitimer", "setitimer",
    "timer_create", "timer_settime", "timer_gettime", "timer_getoverrun", "timer_delete",
];

/// Escape-prone and host-mutating syscalls.
const DENIED: &[&str] = &[
    "ptrace", "mount", "umount", "umount2", "pivot_root", "chroot", "reboot",
    "swapon", "swapoff", "kexec_load", "kexec_file_load",
    "init_module", "finit_module", "delete_module", "acct", "quotactl",
    "bpf", "perf_event_open", "userfaultfd", "setns", "unshare",
    "process_vm_readv", "process_vm_writev", "kcmp",
    "keyctl", "add_key", "request_key",
    "open_by_handle_at", "name_to_handle_at",
    "settimeofday", "clock_settime", "clock_adjtime", "adjtimex",
    "sethostname", "setdomainname", "iopl", "ioperm", "vhangup",
    "fanotify_init", "fanotify_mark", "lookup_dcookie",
    "move_pages", "migrate_pages", "setxattr", "lsetxattr", "fsetxattr",
    "removexattr", "lremovexattr", "fremovexattr",
];

/// `personality` values allowed: default, READ_IMPLIES_EXEC variants and query.
const PERSONALITY_VALUES: &[u64] = &[0x0, 0x8, 0x20000, 0x20008, 0xffff_ffff];

impl SeccompPolicy {
    /// Builds the policy. Pure and deterministic.
    pub fn build() -> Self {
        let allow = |names: &[&'static str]| SyscallRule {
            names: names.to_vec(),
            action: SeccompAction::Allow,
            args: Vec::new(),
        };

        let mut syscalls = vec![
            allow(FILE_IO),
            allow(MEMORY),
            allow(SIGNALS),
            allow(EVENTS),
            allow(SOCKETS),
            allow(PROCESS),
            allow(SCHEDULING),
            allow(TIME),
        ];

        syscalls.extend(PERSONALITY_VALUES.iter().map(|&value| SyscallRule {
            names: vec!["personality"],
            action: SeccompAction::Allow,
            args: vec![SyscallArg {
                index: 0,
                value,
                op: CompareOp::Equal,
            }],
        }));

        syscalls.push(SyscallRule {
            names: DENIED.to_vec(),
            action: SeccompAction::Errno,
            args: Vec::new(),
        });

        Self {
            default_action: SeccompAction::Errno,
            architectures: ARCHITECTURES.to_vec(),
            syscalls,
        }
    }

    /// Serializes the policy, failing loudly rather than emitting a partial one.
    pub fn to_json(&self) -> Result<String, SandboxError> {
        serde_json::to_string_pretty(self).map_err(|e| SandboxError::seccomp(e.to_string()))
    }

    /// Action for an unconditional rule naming `syscall`, if any.
    pub fn action_for(&self, syscall: &str) -> Option<SeccompAction> {
        self.syscalls
            .iter()
            .filter(|rule| rule.args.is_empty())
            .find(|rule| rule.names.contains(&syscall))
            .map(|rule| rule.action)
    }
}

/// A serialized policy shared across executions.
///
/// The container engine takes the policy content inline, so the JSON text is
/// kept alongside the file written for inspection.
#[derive(Debug, Clone)]
pub struct SeccompHandle {
    path: PathBuf,
    json: Arc<str>,
}

impl SeccompHandle {
    /// Serializes the policy once and writes it under `dir`.
    pub fn install(dir: &Path) -> Result<Self, SandboxError> {
        let json = SeccompPolicy::build().to_json()?;
        let path = dir.join(PROFILE_FILE);
        fs::write(&path, &json).map_err(|e| SandboxError::workspace(&path, e))?;
        debug!("Seccomp profile written to {}", path.display());

        Ok(Self {
            path,
            json: Arc::from(json),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn json(&self) -> &str {
        &self.json
    }
}
