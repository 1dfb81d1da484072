//! Runtime options and status reports.

use super::instance::InstanceKey;
use crate::state_machine::{InstanceState, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// `pg_ctl stop` shutdown mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Smart,
    #[default]
    Fast,
    Immediate,
}

impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smart => write!(f, "smart"),
            Self::Fast => write!(f, "fast"),
            Self::Immediate => write!(f, "immediate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Wait until the instance accepts connections
    pub wait: bool,
    /// Extra `-c name=value` parameters for this start only
    pub runtime_parameters: BTreeMap<String, String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            wait: true,
            runtime_parameters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOptions {
    pub mode: StopMode,
    pub wait: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            mode: StopMode::Fast,
            wait: true,
        }
    }
}

/// What an `apply` did; `None` in results means nothing changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Created,
    Changed,
    Dropped,
}

/// Whether a service is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    NotRunning,
    Unknown,
}

/// One satellite service's view of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub status: RunStatus,
    pub detail: Option<String>,
}

impl ServiceStatus {
    pub fn new(service: impl Into<String>, status: RunStatus) -> Self {
        Self {
            service: service.into(),
            status,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Description returned by `get`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub key: InstanceKey,
    pub port: u16,
    pub datadir: PathBuf,
    pub role: Role,
    pub state: InstanceState,
    pub coordinator_managed: bool,
    pub services: Vec<ServiceStatus>,
}
