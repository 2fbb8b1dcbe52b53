//! Network modes for sandbox containers.

use serde::{Deserialize, Serialize};

/// Network access for an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// No network access
    #[default]
    None,
    /// Engine default bridge network
    Bridge,
    /// Host network namespace
    Host,
}

impl NetworkMode {
    pub fn is_disabled(self) -> bool {
        self == Self::None
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bridge => write!(f, "bridge"),
            Self::Host => write!(f, "host"),
        }
    }
}
