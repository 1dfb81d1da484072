//! Instance identity, desired-state manifests, and status reports.

pub mod instance;
pub mod manifest;
pub mod status;

pub use instance::{Instance, InstanceKey};
pub use manifest::{
    AuthOverrides, DatabaseManifest, DesiredState, InstanceManifest, PatroniOptions,
    PgBackRestOptions, PresenceState, StandbySpec,
};
pub use status::{
    ChangeState, InstanceInfo, RunStatus, ServiceStatus, StartOptions, StopMode, StopOptions,
};
