//! CLI command implementations.
//!
//! Each submodule implements an execbox subcommand with formatting kept in
//! pure functions (`format`) separate from IO for testability.

pub mod format;
pub mod images;
pub mod languages;
pub mod run;
pub mod seccomp;

use anyhow::{Context, Result};
use std::path::PathBuf;

use execbox::{Config, ExecutorMode};

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub executor: Option<ExecutorMode>,
    pub workspace_root: Option<PathBuf>,
}

impl GlobalOptions {
    /// Loads `--config`, or `execbox.toml` from the current directory, then
    /// applies command-line overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => {
                let cwd = std::env::current_dir().context("Failed to get current directory")?;
                Config::load(&cwd)?
            }
        };

        if let Some(mode) = self.executor {
            config.executor.mode = mode;
        }
        if let Some(root) = &self.workspace_root {
            config.executor.workspace_root = Some(root.clone());
        }
        // Shutdown removes the root; concurrent invocations must not share one
        if config.executor.workspace_root.is_none() {
            config.executor.workspace_root = Some(
                std::env::temp_dir().join(format!("execbox-cli-{}", std::process::id())),
            );
        }

        Ok(config)
    }
}
