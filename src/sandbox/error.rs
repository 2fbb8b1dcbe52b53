//! Domain-specific error types for sandbox operations.
//!
//! Only infrastructure failures surface as errors. Anything that goes wrong
//! with the submitted program itself (compile error, crash, timeout, kill)
//! is encoded in the `ExecutionResult` instead.

use std::path::{Path, PathBuf};

/// Errors that can occur while setting up or driving the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The container engine is not running or not reachable.
    #[error("Container engine is not available: {message}")]
    EngineUnavailable { message: String },

    /// The seccomp policy could not be serialized or written.
    #[error("Seccomp policy could not be serialized: {message}")]
    SeccompSerialization { message: String },

    /// The workspace root (or a per-execution workspace) could not be created.
    #[error("Failed to prepare workspace {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No profile exists for the requested language.
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    /// `kill` was called with an id the sandbox has never seen.
    #[error("Execution {id} not found")]
    UnknownExecution { id: String },

    /// Configuration could not be loaded or is invalid.
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// A container engine operation failed (create, start, attach, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },

    /// Container image could not be found or built.
    #[error("Container image not available: {image}")]
    ImageNotFound { image: String },
}

impl SandboxError {
    /// Creates an `EngineUnavailable` error.
    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `SeccompSerialization` error.
    pub fn seccomp(message: impl Into<String>) -> Self {
        Self::SeccompSerialization {
            message: message.into(),
        }
    }

    /// Creates a `Workspace` error for the given path.
    pub fn workspace(path: &Path, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Creates an `UnsupportedLanguage` error.
    pub fn unsupported_language(language: impl Into<String>) -> Self {
        Self::UnsupportedLanguage {
            language: language.into(),
        }
    }

    /// Creates an `UnknownExecution` error.
    pub fn unknown_execution(id: impl ToString) -> Self {
        Self::UnknownExecution { id: id.to_string() }
    }

    /// Creates a `Config` error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Returns true if the container engine could not be reached.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::EngineUnavailable { .. })
    }

    /// Returns true if the language has no profile.
    pub fn is_unsupported_language(&self) -> bool {
        matches!(self, Self::UnsupportedLanguage { .. })
    }

    /// Returns true if the execution id was never registered.
    pub fn is_unknown_execution(&self) -> bool {
        matches!(self, Self::UnknownExecution { .. })
    }
}
