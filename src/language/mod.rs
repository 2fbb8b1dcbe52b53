//! Language profiles: resource limits, file naming, source wrapping and the
//! compile/run commands for each supported language.

mod table;

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

use crate::config::{parse_memory_limit, Config};
use crate::sandbox::SandboxError;
use table::{LanguageSpec, LANGUAGES};

/// How submitted source is completed before it is written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceWrap {
    None,
    /// Add `package main` and a `func main` body when missing
    GoMain,
    /// Wrap in `fn main` when missing
    RustMain,
    /// Wrap in a `Main` class when no public class exists; file follows the class
    JavaClass,
    /// Add standard headers and `main` when missing
    CIncludes,
    CppIncludes,
    /// Add the `<?php` open tag
    PhpOpenTag,
}

/// Source ready to be written into a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSource {
    pub file_name: String,
    pub contents: String,
    /// Entry point name (Java main class), empty when unused
    pub entry: String,
}

/// Paths substituted into a profile's command templates.
#[derive(Debug, Clone)]
pub struct CommandContext<'a> {
    /// Path of the source file as the isolation unit sees it
    pub source: &'a str,
    pub workdir: &'a str,
    pub scratch: &'a str,
    pub entry: &'a str,
}

impl CommandContext<'_> {
    fn expand(&self, template: &str) -> String {
        template
            .replace("{source}", self.source)
            .replace("{workdir}", self.workdir)
            .replace("{scratch}", self.scratch)
            .replace("{entry}", self.entry)
    }
}

/// Resource and behavior policy for one language.
#[derive(Debug, Clone, Serialize)]
pub struct LanguageProfile {
    pub id: &'static str,
    pub name: &'static str,
    pub memory_bytes: u64,
    pub cpus: f64,
    #[serde(rename = "timeout_secs", serialize_with = "serialize_secs")]
    pub timeout: Duration,
    pub pids: i64,
    pub scratch_bytes: u64,
    #[serde(skip)]
    spec: &'static LanguageSpec,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl LanguageProfile {
    pub fn aliases(&self) -> &'static [&'static str] {
        self.spec.aliases
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        self.spec.extensions
    }

    pub fn is_compiled(&self) -> bool {
        self.spec.compile.is_some()
    }

    pub fn exec_scratch(&self) -> bool {
        self.spec.exec_scratch
    }

    /// Public image used when no hardened image is available
    pub fn fallback_image(&self) -> &'static str {
        self.spec.image
    }

    /// Name of the hardened image for this language
    pub fn hardened_image(&self, prefix: &str) -> String {
        format!("{prefix}-{}:latest", self.id)
    }

    /// Applies the wrapping rule and picks the file name.
    pub fn prepare_source(&self, code: &str) -> PreparedSource {
        let plain = |contents: String| PreparedSource {
            file_name: self.spec.file_name.to_string(),
            contents,
            entry: String::new(),
        };

        match self.spec.wrap {
            SourceWrap::None => plain(code.to_string()),
            SourceWrap::GoMain => plain(wrap_go(code)),
            SourceWrap::RustMain => {
                if code.contains("fn main") {
                    plain(code.to_string())
                } else {
                    plain(format!("fn main() {{\n{code}\n}}\n"))
                }
            }
            SourceWrap::JavaClass => {
                let (class, contents) = match java_class_name(code) {
                    Some(class) => (class.to_string(), code.to_string()),
                    None => (
                        "Main".to_string(),
                        format!(
                            "public class Main {{\n    public static void main(String[] args) {{\n        {code}\n    }}\n}}\n"
                        ),
                    ),
                };
                PreparedSource {
                    file_name: format!("{class}.java"),
                    contents,
                    entry: class,
                }
            }
            SourceWrap::CIncludes => plain(wrap_c(
                code,
                "#include <stdio.h>\n#include <stdlib.h>\n#include <string.h>\n",
            )),
            SourceWrap::CppIncludes => plain(wrap_c(
                code,
                "#include <iostream>\n#include <vector>\n#include <string>\n#include <algorithm>\nusing namespace std;\n",
            )),
            SourceWrap::PhpOpenTag => {
                if code.trim_start().starts_with("<?") {
                    plain(code.to_string())
                } else {
                    plain(format!("<?php\n{code}"))
                }
            }
        }
    }

    /// Compile argv, or `None` for interpreted languages
    pub fn compile_command(&self, ctx: &CommandContext<'_>) -> Option<Vec<String>> {
        self.spec
            .compile
            .map(|template| template.iter().map(|t| ctx.expand(t)).collect())
    }

    /// Run argv with the caller's program arguments appended
    pub fn run_command(&self, ctx: &CommandContext<'_>, args: &[String]) -> Vec<String> {
        self.spec
            .run
            .iter()
            .map(|t| ctx.expand(t))
            .chain(args.iter().cloned())
            .collect()
    }

    /// Toolchain environment with paths expanded
    pub fn environment(&self, ctx: &CommandContext<'_>) -> Vec<(String, String)> {
        self.spec
            .env
            .iter()
            .map(|(key, value)| ((*key).to_string(), ctx.expand(value)))
            .collect()
    }
}

fn java_class_name(code: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"public\s+class\s+(\w+)").expect("java class pattern is valid")
    });
    re.captures(code)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Adds `package main` and hoists imports above a synthesized `func main`.
fn wrap_go(code: &str) -> String {
    let has_package = code.contains("package ");
    if code.contains("func main(") {
        return if has_package {
            code.to_string()
        } else {
            format!("package main\n\n{code}")
        };
    }

    let mut imports = Vec::new();
    let mut body = Vec::new();
    let mut in_import_block = false;

    for line in code.lines() {
        let trimmed = line.trim();
        if in_import_block {
            imports.push(line);
            if trimmed == ")" {
                in_import_block = false;
            }
        } else if trimmed.starts_with("package ") {
            // replaced below
        } else if trimmed.starts_with("import ") || trimmed == "import(" {
            in_import_block = trimmed.ends_with('(');
            imports.push(line);
        } else {
            body.push(line);
        }
    }

    let mut out = String::from("package main\n\n");
    for line in imports {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("\nfunc main() {\n");
    for line in body {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("}\n");
    out
}

fn wrap_c(code: &str, headers: &str) -> String {
    let mut out = String::new();
    if !code.contains("#include") {
        out.push_str(headers);
        out.push('\n');
    }
    if code.contains("main(") {
        out.push_str(code);
    } else {
        out.push_str("int main(void) {\n");
        out.push_str(code);
        out.push_str("\nreturn 0;\n}\n");
    }
    out
}

/// Lookup table of language profiles, built once at startup.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<LanguageProfile>,
    /// id, alias and extension lookups into `profiles`
    names: HashMap<String, usize>,
    extensions: HashMap<String, usize>,
}

impl ProfileRegistry {
    /// Builds profiles from the built-in table, applying configured overrides.
    ///
    /// Precedence per field: `[languages.<id>]`, then the built-in language
    /// default, then the global `[limits]`.
    pub fn new(config: &Config) -> Result<Self, SandboxError> {
        let mut names = HashMap::new();
        let mut extensions = HashMap::new();

        for (index, spec) in LANGUAGES.iter().enumerate() {
            names.insert(spec.id.to_string(), index);
            for alias in spec.aliases {
                names.insert((*alias).to_string(), index);
            }
            for ext in spec.extensions {
                extensions.insert((*ext).to_string(), index);
            }
        }

        for key in config.languages.keys() {
            if !names.contains_key(&key.to_lowercase()) {
                warn!("Ignoring overrides for unknown language '{}'", key);
            }
        }

        let global_memory = parse_memory_limit(&config.limits.memory)?;
        let global_scratch = parse_memory_limit(&config.limits.scratch)?;

        let mut profiles = Vec::with_capacity(LANGUAGES.len());
        for spec in LANGUAGES {
            let overrides = config
                .languages
                .iter()
                .find(|(key, _)| names.get(&key.to_lowercase()) == names.get(spec.id))
                .map(|(_, o)| o);

            let builtin = spec.limits;
            let mb = |v: u64| v * 1024 * 1024;

            let memory_bytes = match overrides.and_then(|o| o.memory.as_deref()) {
                Some(memory) => parse_memory_limit(memory)?,
                None => builtin.map_or(global_memory, |b| mb(b.memory_mb)),
            };
            let scratch_bytes = match overrides.and_then(|o| o.scratch.as_deref()) {
                Some(scratch) => parse_memory_limit(scratch)?,
                None => builtin.map_or(global_scratch, |b| mb(b.scratch_mb)),
            };
            let cpus = overrides
                .and_then(|o| o.cpus)
                .or(builtin.map(|b| b.cpus))
                .unwrap_or(config.limits.cpus);
            let timeout_secs = overrides
                .and_then(|o| o.timeout_secs)
                .or(builtin.map(|b| b.timeout_secs))
                .unwrap_or(config.limits.timeout_secs);
            let pids = overrides
                .and_then(|o| o.pids)
                .or(builtin.map(|b| b.pids))
                .unwrap_or(config.limits.pids);

            if cpus <= 0.0 || timeout_secs == 0 || pids <= 0 {
                return Err(SandboxError::config(format!(
                    "limits for '{}' must be positive",
                    spec.id
                )));
            }

            profiles.push(LanguageProfile {
                id: spec.id,
                name: spec.name,
                memory_bytes,
                cpus,
                timeout: Duration::from_secs(timeout_secs),
                pids,
                scratch_bytes,
                spec,
            });
        }

        Ok(Self {
            profiles,
            names,
            extensions,
        })
    }

    /// Looks up a profile by id or alias, case-insensitively.
    pub fn get(&self, language: &str) -> Result<&LanguageProfile, SandboxError> {
        self.names
            .get(&language.trim().to_lowercase())
            .map(|&index| &self.profiles[index])
            .ok_or_else(|| SandboxError::unsupported_language(language))
    }

    /// Infers the language from a file extension.
    pub fn language_for_path(&self, path: &Path) -> Option<&LanguageProfile> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.extensions.get(&ext).map(|&index| &self.profiles[index])
    }

    pub fn list(&self) -> &[LanguageProfile] {
        &self.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageOverride;

    fn registry() -> ProfileRegistry {
        ProfileRegistry::new(&Config::default()).unwrap()
    }

    fn ctx<'a>() -> CommandContext<'a> {
        CommandContext {
            source: "/work/main.go",
            workdir: "/work",
            scratch: "/tmp",
            entry: "",
        }
    }

    #[test]
    fn test_get_by_alias_is_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.get("Python").unwrap().id, "python");
        assert_eq!(registry.get("py").unwrap().id, "python");
        assert_eq!(registry.get("c++").unwrap().id, "cpp");
        assert_eq!(registry.get("golang").unwrap().id, "go");
    }

    #[test]
    fn test_unknown_language_is_not_guessed() {
        let err = registry().get("cobol").unwrap_err();
        assert!(err.is_unsupported_language());
    }

    #[test]
    fn test_builtin_limits() {
        let registry = registry();
        let java = registry.get("java").unwrap();
        assert_eq!(java.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(java.pids, 200);
        assert_eq!(java.timeout, Duration::from_secs(60));

        let c = registry.get("c").unwrap();
        assert_eq!(c.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(c.scratch_bytes, 32 * 1024 * 1024);
    }

    #[test]
    fn test_global_limits_apply_without_builtin() {
        let mut config = Config::default();
        config.limits.timeout_secs = 7;
        config.limits.memory = "1g".to_string();
        let registry = ProfileRegistry::new(&config).unwrap();

        let ruby = registry.get("ruby").unwrap();
        assert_eq!(ruby.timeout, Duration::from_secs(7));
        assert_eq!(ruby.memory_bytes, 1024 * 1024 * 1024);
        // Built-in defaults still win for languages that have them
        assert_eq!(
            registry.get("python").unwrap().timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_config_override_wins() {
        let mut config = Config::default();
        config.languages.insert(
            "py".to_string(),
            LanguageOverride {
                timeout_secs: Some(5),
                memory: Some("64m".to_string()),
                ..Default::default()
            },
        );
        let registry = ProfileRegistry::new(&config).unwrap();
        let python = registry.get("python").unwrap();
        assert_eq!(python.timeout, Duration::from_secs(5));
        assert_eq!(python.memory_bytes, 64 * 1024 * 1024);
        assert!((python.cpus - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let mut config = Config::default();
        config.languages.insert(
            "go".to_string(),
            LanguageOverride {
                memory: Some("huge".to_string()),
                ..Default::default()
            },
        );
        assert!(ProfileRegistry::new(&config).is_err());
    }

    #[test]
    fn test_language_for_path() {
        let registry = registry();
        let lang = |p: &str| registry.language_for_path(Path::new(p)).map(|l| l.id);
        assert_eq!(lang("hello.py"), Some("python"));
        assert_eq!(lang("/tmp/Main.JAVA"), Some("java"));
        assert_eq!(lang("x.cc"), Some("cpp"));
        assert_eq!(lang("notes.xyz"), None);
        assert_eq!(lang("Makefile"), None);
    }

    #[test]
    fn test_go_wrapping_synthesizes_entry_point() {
        let go = registry().get("go").unwrap().clone();
        let prepared = go.prepare_source("import \"fmt\"\nfmt.Println(\"hi\")");
        assert_eq!(prepared.file_name, "main.go");
        assert!(prepared.contents.starts_with("package main\n"));
        let import_at = prepared.contents.find("import \"fmt\"").unwrap();
        let main_at = prepared.contents.find("func main() {").unwrap();
        assert!(import_at < main_at);
        assert!(prepared.contents.trim_end().ends_with('}'));
    }

    #[test]
    fn test_go_wrapping_hoists_import_block() {
        let go = registry().get("go").unwrap().clone();
        let prepared = go.prepare_source("import (\n\t\"fmt\"\n)\nfmt.Println(1)");
        let main_at = prepared.contents.find("func main()").unwrap();
        assert!(prepared.contents.find("\"fmt\"").unwrap() < main_at);
        assert!(prepared.contents.find("fmt.Println(1)").unwrap() > main_at);
    }

    #[test]
    fn test_go_wrapped_snippet_builds_and_runs() {
        let Ok(version) = std::process::Command::new("go").arg("version").output() else {
            eprintln!("go not available, skipping");
            return;
        };
        if !version.status.success() {
            return;
        }

        let go = registry().get("go").unwrap().clone();
        let prepared = go.prepare_source("import (\n\t\"fmt\"\n\t\"strings\"\n)\n\nfmt.Println(strings.ToUpper(\"hi\"))");
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join(&prepared.file_name);
        std::fs::write(&source, &prepared.contents).unwrap();

        let binary = dir.path().join("main");
        let build = std::process::Command::new("go")
            .arg("build")
            .arg("-o")
            .arg(&binary)
            .arg(&source)
            .current_dir(dir.path())
            .env("GOCACHE", dir.path().join("cache"))
            .env("CGO_ENABLED", "0")
            .output()
            .unwrap();
        assert!(
            build.status.success(),
            "{}\n{}",
            prepared.contents,
            String::from_utf8_lossy(&build.stderr)
        );

        let run = std::process::Command::new(&binary).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&run.stdout), "HI\n");
    }

    #[test]
    fn test_go_complete_program_is_untouched() {
        let go = registry().get("go").unwrap().clone();
        let code = "package main\n\nfunc main() {}\n";
        assert_eq!(go.prepare_source(code).contents, code);
    }

    #[test]
    fn test_java_file_follows_class() {
        let java = registry().get("java").unwrap().clone();
        let prepared = java.prepare_source("public class Greeter { public static void main(String[] a) {} }");
        assert_eq!(prepared.file_name, "Greeter.java");
        assert_eq!(prepared.entry, "Greeter");

        let wrapped = java.prepare_source("System.out.println(1);");
        assert_eq!(wrapped.file_name, "Main.java");
        assert!(wrapped.contents.contains("public class Main"));
    }

    #[test]
    fn test_rust_and_php_wrapping() {
        let registry = registry();
        let rust = registry.get("rust").unwrap();
        assert!(rust
            .prepare_source("println!(\"x\");")
            .contents
            .starts_with("fn main() {"));

        let php = registry.get("php").unwrap();
        assert_eq!(php.prepare_source("echo 1;").contents, "<?php\necho 1;");
        assert_eq!(php.prepare_source("<?php echo 1;").contents, "<?php echo 1;");
    }

    #[test]
    fn test_c_wrapping_adds_headers_and_main() {
        let c = registry().get("c").unwrap().clone();
        let prepared = c.prepare_source("printf(\"hi\\n\");");
        assert!(prepared.contents.starts_with("#include <stdio.h>"));
        assert!(prepared.contents.contains("int main(void)"));
    }

    #[test]
    fn test_command_expansion() {
        let registry = registry();
        let go = registry.get("go").unwrap();
        let compile = go.compile_command(&ctx()).unwrap();
        assert_eq!(compile, ["go", "build", "-o", "/tmp/main", "/work/main.go"]);
        let run = go.run_command(&ctx(), &["a b".to_string()]);
        assert_eq!(run, ["/tmp/main", "a b"]);

        let python = registry.get("python").unwrap();
        assert!(python.compile_command(&ctx()).is_none());
        assert!(!python.is_compiled());
    }

    #[test]
    fn test_environment_expands_scratch() {
        let registry = registry();
        let env = registry.get("go").unwrap().environment(&ctx());
        assert!(env.contains(&("GOCACHE".to_string(), "/tmp/go-cache".to_string())));
    }

    #[test]
    fn test_hardened_image_name() {
        let registry = registry();
        let python = registry.get("python").unwrap();
        assert_eq!(
            python.hardened_image("execbox-sandbox"),
            "execbox-sandbox-python:latest"
        );
        assert_eq!(python.fallback_image(), "python:3.12-slim");
    }
}
