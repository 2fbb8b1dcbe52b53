//! Isolated, resource-limited execution of untrusted source code.
//!
//! ```no_run
//! use execbox::{Config, ExecutionRequest, Sandbox};
//!
//! # async fn demo() -> Result<(), execbox::SandboxError> {
//! let sandbox = Sandbox::new(Config::default()).await?;
//! let result = sandbox
//!     .execute(ExecutionRequest::new("python", "print('hello')"))
//!     .await?;
//! println!("{} {}", result.state, result.stdout);
//! sandbox.cleanup().await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cache;
pub mod config;
pub mod language;
pub mod result;
pub mod sandbox;
pub mod seccomp;
pub mod stats;

pub use config::{Config, ExecutorMode};
pub use language::{LanguageProfile, ProfileRegistry};
pub use result::{ExecutionId, ExecutionRequest, ExecutionResult, ExecutionState, ExecutorKind};
pub use sandbox::{Capabilities, NetworkMode, Sandbox, SandboxError, SweepReport};
pub use seccomp::SeccompPolicy;
pub use stats::SandboxStats;
