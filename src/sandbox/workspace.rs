//! Per-execution workspace directories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::SandboxError;
use crate::language::PreparedSource;
use crate::result::ExecutionId;

const WORKSPACE_PREFIX: &str = "exec-";

/// Owns the workspace root and hands out per-execution directories.
#[derive(Debug, Clone)]
pub(crate) struct WorkspaceManager {
    root: PathBuf,
    cleanup_delay: Duration,
}

impl WorkspaceManager {
    /// Creates the root directory. Failure here is fatal for the sandbox.
    pub fn new(root: PathBuf, cleanup_delay: Duration) -> Result<Self, SandboxError> {
        fs::create_dir_all(&root).map_err(|e| SandboxError::workspace(&root, e))?;
        Ok(Self {
            root,
            cleanup_delay,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates `exec-<id>` under the root.
    pub fn create(&self, id: ExecutionId) -> Result<WorkspaceGuard, SandboxError> {
        let path = self.root.join(format!("{WORKSPACE_PREFIX}{id}"));
        fs::create_dir(&path)
            .and_then(|()| set_mode(&path, 0o755))
            .map_err(|e| SandboxError::workspace(&path, e))?;

        debug!("Created workspace {}", path.display());
        Ok(WorkspaceGuard {
            path,
            root: self.root.clone(),
            delay: self.cleanup_delay,
        })
    }

    /// Deletes workspaces whose last modification is older than `max_age`.
    /// Returns how many were removed; failures are logged and retried on the
    /// next sweep.
    pub fn sweep_old(&self, max_age: Duration) -> u32 {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan workspace root {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries.flatten() {
            let is_workspace = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(WORKSPACE_PREFIX));
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !is_workspace || !metadata.is_dir() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    debug!("Swept stale workspace {}", entry.path().display());
                    removed += 1;
                }
                Err(e) => warn!(
                    "Failed to remove stale workspace {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }

        removed
    }

    /// Removes the whole root, used at shutdown.
    pub fn remove_root(&self) -> Result<(), SandboxError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::workspace(&self.root, e)),
        }
    }
}

/// One execution's directory. Removal is scheduled when the guard drops,
/// on every exit path.
#[derive(Debug)]
pub(crate) struct WorkspaceGuard {
    path: PathBuf,
    root: PathBuf,
    delay: Duration,
}

impl WorkspaceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the prepared source, world-readable so the unprivileged
    /// sandbox user can read it.
    pub fn write_source(&self, source: &PreparedSource) -> io::Result<PathBuf> {
        let file = self.path.join(&source.file_name);
        fs::write(&file, &source.contents)?;
        set_mode(&file, 0o644)?;
        Ok(file)
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        // Never touch anything outside the root
        if !self.path.starts_with(&self.root) || self.path == self.root {
            return;
        }

        let path = std::mem::take(&mut self.path);
        let delay = self.delay;

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                remove_workspace(&path);
            });
        } else {
            remove_workspace(&path);
        }
    }
}

fn remove_workspace(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!("Removed workspace {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove workspace {}: {}", path.display(), e),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
