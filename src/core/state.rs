//! Launch state - Lifecycle states shared by both facades

use serde::{Deserialize, Serialize};

/// Lifecycle state of one deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchState {
    /// Registered, never launched
    #[default]
    Idle,
    /// Blocking launch in progress
    Launching,
    /// Application started and still running
    Running,
    /// Application finished without error
    Complete,
    /// Resolution or startup failed, or the application stopped with an error
    Failed,
    /// Stopped by an explicit cancel
    Cancelled,
    /// Teardown failed
    Error,
    /// No deployment with the requested identity
    Unknown,
}

impl LaunchState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Launching | Self::Running)
    }

    /// Whether a new launch may rebuild the record's runner and context
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Cancelled | Self::Error
        )
    }
}

impl std::fmt::Display for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
