//! Shared package caches mounted into executions.
//!
//! Caches are shared read-write between concurrent executions of the same
//! language. They only save downloads and are not an isolation boundary.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One toolchain cache directory.
struct CacheSpec {
    name: &'static str,
    container_path: &'static str,
    env: &'static [&'static str],
}

/// Caches per language id.
static CACHES: &[(&str, &[CacheSpec])] = &[
    (
        "javascript",
        &[CacheSpec {
            name: "npm",
            container_path: "/cache/npm",
            env: &["NPM_CONFIG_CACHE"],
        }],
    ),
    (
        "typescript",
        &[CacheSpec {
            name: "npm",
            container_path: "/cache/npm",
            env: &["NPM_CONFIG_CACHE"],
        }],
    ),
    (
        "python",
        &[CacheSpec {
            name: "pip",
            container_path: "/cache/pip",
            env: &["PIP_CACHE_DIR"],
        }],
    ),
    (
        "go",
        &[
            CacheSpec {
                name: "go-build",
                container_path: "/cache/go-build",
                env: &["GOCACHE"],
            },
            CacheSpec {
                name: "go-mod",
                container_path: "/cache/go-mod",
                env: &["GOMODCACHE"],
            },
        ],
    ),
    (
        "rust",
        &[
            CacheSpec {
                name: "cargo-home",
                container_path: "/cache/cargo-home",
                env: &["CARGO_HOME"],
            },
            CacheSpec {
                name: "cargo-target",
                container_path: "/cache/cargo-target",
                env: &["CARGO_TARGET_DIR"],
            },
        ],
    ),
    (
        "java",
        &[CacheSpec {
            name: "m2",
            container_path: "/cache/m2",
            env: &["MAVEN_CONFIG"],
        }],
    ),
];

/// A host cache directory bind-mounted into an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCacheMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
    /// Variables pointing the toolchain at `container_path`
    pub env: Vec<(String, String)>,
}

impl PackageCacheMount {
    /// Bind spec in `host:container[:ro]` form
    pub fn bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!(
            "{}:{}:{mode}",
            self.host_path.display(),
            self.container_path
        )
    }

    /// The same variables pointed at the host directory, for executions
    /// that run directly on the host.
    pub fn host_env(&self) -> Vec<(String, String)> {
        let host = self.host_path.display().to_string();
        self.env
            .iter()
            .map(|(key, _)| (key.clone(), host.clone()))
            .collect()
    }
}

/// Hands out package cache mounts per language.
#[derive(Debug, Clone)]
pub struct PackageCacheManager {
    base_dir: PathBuf,
    enabled: bool,
}

impl PackageCacheManager {
    pub fn new(base_dir: PathBuf, enabled: bool) -> Self {
        Self { base_dir, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Cache mounts for a canonical language id. Host directories are created
    /// on first use; a directory that cannot be created is skipped.
    pub fn mounts_for(&self, language: &str) -> Vec<PackageCacheMount> {
        if !self.enabled {
            return Vec::new();
        }

        let Some((_, specs)) = CACHES.iter().find(|(id, _)| *id == language) else {
            return Vec::new();
        };

        specs
            .iter()
            .filter_map(|spec| {
                let host_path = self.base_dir.join(sanitize_cache_name(spec.name));
                if let Err(e) = ensure_cache_dir(&host_path) {
                    warn!(
                        "Skipping package cache {}: {}",
                        host_path.display(),
                        e
                    );
                    return None;
                }

                Some(PackageCacheMount {
                    host_path,
                    container_path: spec.container_path.to_string(),
                    read_only: false,
                    env: spec
                        .env
                        .iter()
                        .map(|key| ((*key).to_string(), spec.container_path.to_string()))
                        .collect(),
                })
            })
            .collect()
    }
}

/// Creates the directory writable by the unprivileged sandbox user.
fn ensure_cache_dir(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
    }
    debug!("Created package cache {}", path.display());
    Ok(())
}

/// Restricts a cache name to `[a-z0-9_-]`.
pub fn sanitize_cache_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            _ => '-',
        })
        .collect();

    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
