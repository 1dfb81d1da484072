//! The contract satellite services implement.

use super::hooks::HookName;
use crate::error::ControlResult;
use crate::models::{Instance, InstanceManifest, ServiceStatus, StartOptions, StopMode, StopOptions};
use crate::pgconf::{ConfigChanges, Settings};
use async_trait::async_trait;

/// A component that participates in instance lifecycle hooks.
///
/// Every hook method defaults to "no answer" (`Ok(None)`), so a service only
/// overrides the hooks it declares in [`SatelliteService::hooks`]. Returning
/// `Some` from a first-non-null hook claims the operation and stops dispatch.
#[async_trait]
pub trait SatelliteService: Send + Sync {
    /// Unique name within a registry
    fn name(&self) -> &str;

    /// Hooks this service is registered for
    fn hooks(&self) -> &'static [HookName];

    /// Initialize the data directory
    async fn init_postgresql(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    /// Settings this service needs in `postgresql.conf`
    async fn instance_settings(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<Settings>> {
        Ok(None)
    }

    /// Write the effective configuration, returning what changed
    async fn configure_postgresql(
        &self,
        _configuration: &Settings,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<ConfigChanges>> {
        Ok(None)
    }

    /// React to a configuration change
    async fn postgresql_configured(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
        _changes: &ConfigChanges,
    ) -> ControlResult<Option<()>> {
        Ok(None)
    }

    async fn configure_auth(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    async fn start_postgresql(
        &self,
        _instance: &Instance,
        _options: &StartOptions,
    ) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    async fn stop_postgresql(
        &self,
        _instance: &Instance,
        _options: &StopOptions,
    ) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    async fn restart_postgresql(
        &self,
        _instance: &Instance,
        _mode: StopMode,
        _wait: bool,
    ) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    async fn reload_postgresql(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    async fn promote_postgresql(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    /// Whether this service controls the instance's lifecycle
    async fn coordinator_managed(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
        Ok(None)
    }

    async fn instance_status(&self, _instance: &Instance) -> ControlResult<Option<ServiceStatus>> {
        Ok(None)
    }

    /// Remove everything this service created for the instance
    async fn instance_dropped(&self, _instance: &Instance) -> ControlResult<Option<()>> {
        Ok(None)
    }
}
