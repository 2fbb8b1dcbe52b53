//! Built-in language table.
//!
//! Adding a language is a new entry here; nothing else dispatches on the
//! language id. Command templates expand `{source}`, `{workdir}`, `{scratch}`
//! and `{entry}` per argument, never through a shell.

use super::SourceWrap;

/// Built-in resource defaults for a language.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BuiltinLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub timeout_secs: u64,
    pub pids: i64,
    pub scratch_mb: u64,
}

/// Static description of a supported language.
#[derive(Debug)]
pub(crate) struct LanguageSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub extensions: &'static [&'static str],
    /// File the source is written to, unless the wrap rule names one
    pub file_name: &'static str,
    pub wrap: SourceWrap,
    pub compile: Option<&'static [&'static str]>,
    pub run: &'static [&'static str],
    /// `None` means the global `[limits]` apply
    pub limits: Option<BuiltinLimits>,
    /// Public image, also the base of the hardened image
    pub image: &'static str,
    pub env: &'static [(&'static str, &'static str)],
    /// Compiled binaries run from scratch space, so it must allow exec
    pub exec_scratch: bool,
}

const INTERPRETED: BuiltinLimits = BuiltinLimits {
    memory_mb: 256,
    cpus: 0.5,
    timeout_secs: 30,
    pids: 50,
    scratch_mb: 64,
};

const HEAVY_COMPILED: BuiltinLimits = BuiltinLimits {
    memory_mb: 512,
    cpus: 1.0,
    timeout_secs: 60,
    pids: 100,
    scratch_mb: 128,
};

pub(crate) static LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        id: "python",
        name: "Python",
        aliases: &["py", "python3"],
        extensions: &["py"],
        file_name: "main.py",
        wrap: SourceWrap::None,
        compile: None,
        run: &["python3", "-u", "{source}"],
        limits: Some(INTERPRETED),
        image: "python:3.12-slim",
        env: &[("PYTHONDONTWRITEBYTECODE", "1"), ("PYTHONUNBUFFERED", "1")],
        exec_scratch: false,
    },
    LanguageSpec {
        id: "javascript",
        name: "JavaScript",
        aliases: &["js", "node", "nodejs"],
        extensions: &["js", "mjs", "cjs"],
        file_name: "main.js",
        wrap: SourceWrap::None,
        compile: None,
        run: &["node", "--jitless", "{source}"],
        limits: Some(INTERPRETED),
        image: "node:20-slim",
        env: &[("NODE_ENV", "production")],
        exec_scratch: false,
    },
    LanguageSpec {
        id: "typescript",
        name: "TypeScript",
        aliases: &["ts"],
        extensions: &["ts"],
        file_name: "main.ts",
        wrap: SourceWrap::None,
        compile: None,
        run: &[
            "node",
            "--experimental-strip-types",
            "--no-warnings",
            "{source}",
        ],
        limits: Some(INTERPRETED),
        image: "node:22-slim",
        env: &[("NODE_ENV", "production")],
        exec_scratch: false,
    },
    LanguageSpec {
        id: "go",
        name: "Go",
        aliases: &["golang"],
        extensions: &["go"],
        file_name: "main.go",
        wrap: SourceWrap::GoMain,
        compile: Some(&["go", "build", "-o", "{scratch}/main", "{source}"]),
        run: &["{scratch}/main"],
        limits: Some(HEAVY_COMPILED),
        image: "golang:1.22",
        env: &[
            ("GOCACHE", "{scratch}/go-cache"),
            ("GOMODCACHE", "{scratch}/go-mod"),
            ("GOPATH", "{scratch}/go"),
            ("CGO_ENABLED", "0"),
        ],
        exec_scratch: true,
    },
    LanguageSpec {
        id: "rust",
        name: "Rust",
        aliases: &["rs"],
        extensions: &["rs"],
        file_name: "main.rs",
        wrap: SourceWrap::RustMain,
        compile: Some(&["rustc", "-o", "{scratch}/main", "{source}"]),
        run: &["{scratch}/main"],
        limits: Some(HEAVY_COMPILED),
        image: "rust:1.75-slim",
        env: &[("CARGO_HOME", "{scratch}/.cargo")],
        exec_scratch: true,
    },
    LanguageSpec {
        id: "java",
        name: "Java",
        aliases: &[],
        extensions: &["java"],
        file_name: "Main.java",
        wrap: SourceWrap::JavaClass,
        compile: Some(&["javac", "-d", "{scratch}", "{source}"]),
        run: &["java", "-cp", "{scratch}", "{entry}"],
        limits: Some(BuiltinLimits {
            pids: 200,
            ..HEAVY_COMPILED
        }),
        image: "eclipse-temurin:21-jdk",
        env: &[],
        exec_scratch: false,
    },
    LanguageSpec {
        id: "c",
        name: "C",
        aliases: &[],
        extensions: &["c"],
        file_name: "main.c",
        wrap: SourceWrap::CIncludes,
        compile: Some(&["gcc", "-O2", "-o", "{scratch}/main", "{source}", "-lm"]),
        run: &["{scratch}/main"],
        limits: Some(BuiltinLimits {
            memory_mb: 128,
            cpus: 0.5,
            timeout_secs: 30,
            pids: 50,
            scratch_mb: 32,
        }),
        image: "gcc:13",
        env: &[],
        exec_scratch: true,
    },
    LanguageSpec {
        id: "cpp",
        name: "C++",
        aliases: &["c++", "cplusplus", "cxx"],
        extensions: &["cpp", "cc", "cxx"],
        file_name: "main.cpp",
        wrap: SourceWrap::CppIncludes,
        compile: Some(&[
            "g++",
            "-std=c++17",
            "-O2",
            "-o",
            "{scratch}/main",
            "{source}",
        ]),
        run: &["{scratch}/main"],
        limits: Some(INTERPRETED),
        image: "gcc:13",
        env: &[],
        exec_scratch: true,
    },
    LanguageSpec {
        id: "ruby",
        name: "Ruby",
        aliases: &["rb"],
        extensions: &["rb"],
        file_name: "main.rb",
        wrap: SourceWrap::None,
        compile: None,
        run: &["ruby", "{source}"],
        limits: None,
        image: "ruby:3.3-slim",
        env: &[],
        exec_scratch: false,
    },
    LanguageSpec {
        id: "php",
        name: "PHP",
        aliases: &[],
        extensions: &["php"],
        file_name: "main.php",
        wrap: SourceWrap::PhpOpenTag,
        compile: None,
        run: &["php", "{source}"],
        limits: None,
        image: "php:8.3-cli",
        env: &[],
        exec_scratch: false,
    },
    LanguageSpec {
        id: "shell",
        name: "Shell",
        aliases: &["sh", "bash"],
        extensions: &["sh"],
        file_name: "main.sh",
        wrap: SourceWrap::None,
        compile: None,
        run: &["sh", "{source}"],
        limits: None,
        image: "debian:bookworm-slim",
        env: &[],
        exec_scratch: false,
    },
];
