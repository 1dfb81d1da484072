use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Nothing on disk
    #[default]
    Absent,
    /// Creation pipeline in progress
    Creating,
    /// Initialized and configured, never started
    Configured,
    /// PostgreSQL is accepting connections
    Running,
    /// Initialized but not running
    Stopped,
    /// Removed from disk
    Dropped,
}

impl InstanceState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dropped)
    }

    /// Check if the instance exists on disk in this state
    pub fn exists(&self) -> bool {
        matches!(self, Self::Configured | Self::Running | Self::Stopped)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Creating => write!(f, "creating"),
            Self::Configured => write!(f, "configured"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(Self::Absent),
            "creating" => Ok(Self::Creating),
            "configured" => Ok(Self::Configured),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "dropped" => Ok(Self::Dropped),
            _ => Err(format!("Invalid instance state: {s}")),
        }
    }
}

/// Replication role of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Primary,
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Standby => write!(f, "standby"),
        }
    }
}
