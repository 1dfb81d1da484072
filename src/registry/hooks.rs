//! Hook names and their dispatch policies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How results of several implementations combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinePolicy {
    /// Stop at the first implementation that returns a value
    FirstNonNull,
    /// Call every implementation, keep all non-null values
    CollectAll,
    /// True if any implementation returns true
    BooleanAny,
}

/// What happens when an implementation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The first error stops dispatch and propagates
    Abort,
    /// Every implementation runs; errors are reported alongside results
    Collect,
}

/// Dispatch policy of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSpec {
    pub policy: CombinePolicy,
    pub on_error: FailureMode,
}

/// Extension points of the instance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    InitPostgresql,
    InstanceSettings,
    ConfigurePostgresql,
    PostgresqlConfigured,
    ConfigureAuth,
    StartPostgresql,
    StopPostgresql,
    RestartPostgresql,
    ReloadPostgresql,
    PromotePostgresql,
    CoordinatorManaged,
    InstanceStatus,
    InstanceDropped,
}

impl HookName {
    pub const ALL: [HookName; 13] = [
        Self::InitPostgresql,
        Self::InstanceSettings,
        Self::ConfigurePostgresql,
        Self::PostgresqlConfigured,
        Self::ConfigureAuth,
        Self::StartPostgresql,
        Self::StopPostgresql,
        Self::RestartPostgresql,
        Self::ReloadPostgresql,
        Self::PromotePostgresql,
        Self::CoordinatorManaged,
        Self::InstanceStatus,
        Self::InstanceDropped,
    ];

    /// The dispatch policy every caller of this hook must use
    pub fn spec(&self) -> HookSpec {
        use CombinePolicy::*;
        let (policy, on_error) = match self {
            Self::InitPostgresql
            | Self::ConfigurePostgresql
            | Self::ConfigureAuth
            | Self::StartPostgresql
            | Self::StopPostgresql
            | Self::RestartPostgresql
            | Self::ReloadPostgresql
            | Self::PromotePostgresql => (FirstNonNull, FailureMode::Abort),
            Self::InstanceSettings | Self::PostgresqlConfigured | Self::InstanceStatus => {
                (CollectAll, FailureMode::Abort)
            }
            Self::CoordinatorManaged => (BooleanAny, FailureMode::Abort),
            Self::InstanceDropped => (CollectAll, FailureMode::Collect),
        };
        HookSpec { policy, on_error }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitPostgresql => "init_postgresql",
            Self::InstanceSettings => "instance_settings",
            Self::ConfigurePostgresql => "configure_postgresql",
            Self::PostgresqlConfigured => "postgresql_configured",
            Self::ConfigureAuth => "configure_auth",
            Self::StartPostgresql => "start_postgresql",
            Self::StopPostgresql => "stop_postgresql",
            Self::RestartPostgresql => "restart_postgresql",
            Self::ReloadPostgresql => "reload_postgresql",
            Self::PromotePostgresql => "promote_postgresql",
            Self::CoordinatorManaged => "coordinator_managed",
            Self::InstanceStatus => "instance_status",
            Self::InstanceDropped => "instance_dropped",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for CombinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstNonNull => write!(f, "first_non_null"),
            Self::CollectAll => write!(f, "collect_all"),
            Self::BooleanAny => write!(f, "boolean_any"),
        }
    }
}
