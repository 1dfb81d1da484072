//! Satellite services that record the hooks they are called for.

use async_trait::async_trait;
use parking_lot::Mutex;
use pgcontrol_core::error::{ControlError, ControlResult};
use pgcontrol_core::models::{
    Instance, InstanceManifest, RunStatus, ServiceStatus, StartOptions, StopMode, StopOptions,
};
use pgcontrol_core::pgconf::{ConfigChanges, Settings};
use pgcontrol_core::registry::{HookName, SatelliteService};
use std::sync::Arc;

/// Calls shared by every service of a test, as `service:hook`
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().clone()
}

/// Configurable stand-in for a satellite service.
///
/// By default it answers nothing; `claiming` makes first-non-null hooks
/// return a value and teardown report a cleanup.
pub struct RecordingService {
    name: &'static str,
    hooks: &'static [HookName],
    log: CallLog,
    claims: bool,
    fail_on: Option<HookName>,
    settings: Option<Settings>,
    managed: Option<bool>,
    status: Option<RunStatus>,
}

impl RecordingService {
    pub fn new(name: &'static str, hooks: &'static [HookName], log: CallLog) -> Self {
        Self {
            name,
            hooks,
            log,
            claims: false,
            fail_on: None,
            settings: None,
            managed: None,
            status: None,
        }
    }

    pub fn claiming(mut self) -> Self {
        self.claims = true;
        self
    }

    pub fn failing_on(mut self, hook: HookName) -> Self {
        self.fail_on = Some(hook);
        self
    }

    pub fn contributing(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn managing(mut self, managed: bool) -> Self {
        self.managed = Some(managed);
        self
    }

    pub fn reporting(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn shared(self) -> Arc<dyn SatelliteService> {
        Arc::new(self)
    }

    fn record(&self, hook: HookName) -> ControlResult<()> {
        self.log.lock().push(format!("{}:{hook}", self.name));
        if self.fail_on == Some(hook) {
            return Err(ControlError::system(format!("{} failed in {hook}", self.name)));
        }
        Ok(())
    }

    fn claim(&self, hook: HookName) -> ControlResult<Option<bool>> {
        self.record(hook)?;
        Ok(self.claims.then_some(true))
    }
}

#[async_trait]
impl SatelliteService for RecordingService {
    fn name(&self) -> &str {
        self.name
    }

    fn hooks(&self) -> &'static [HookName] {
        self.hooks
    }

    async fn init_postgresql(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<bool>> {
        self.claim(HookName::InitPostgresql)
    }

    async fn instance_settings(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<Settings>> {
        self.record(HookName::InstanceSettings)?;
        Ok(self.settings.clone())
    }

    async fn configure_postgresql(
        &self,
        _configuration: &Settings,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<ConfigChanges>> {
        self.record(HookName::ConfigurePostgresql)?;
        Ok(self.claims.then(ConfigChanges::new))
    }

    async fn postgresql_configured(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
        _changes: &ConfigChanges,
    ) -> ControlResult<Option<()>> {
        self.record(HookName::PostgresqlConfigured)?;
        Ok(Some(()))
    }

    async fn configure_auth(
        &self,
        _manifest: &InstanceManifest,
        _instance: &Instance,
    ) -> ControlResult<Option<bool>> {
        self.claim(HookName::ConfigureAuth)
    }

    async fn start_postgresql(
        &self,
        _instance: &Instance,
        _options: &StartOptions,
    ) -> ControlResult<Option<bool>> {
        self.claim(HookName::StartPostgresql)
    }

    async fn stop_postgresql(
        &self,
        _instance: &Instance,
        _options: &StopOptions,
    ) -> ControlResult<Option<bool>> {
        self.claim(HookName::StopPostgresql)
    }

    async fn restart_postgresql(
        &self,
        _instance: &Instance,
        _mode: StopMode,
        _wait: bool,
    ) -> ControlResult<Option<bool>> {
        self.claim(HookName::RestartPostgresql)
    }

    async fn reload_postgresql(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
        self.claim(HookName::ReloadPostgresql)
    }

    async fn promote_postgresql(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
        self.claim(HookName::PromotePostgresql)
    }

    async fn coordinator_managed(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
        self.record(HookName::CoordinatorManaged)?;
        Ok(self.managed)
    }

    async fn instance_status(&self, _instance: &Instance) -> ControlResult<Option<ServiceStatus>> {
        self.record(HookName::InstanceStatus)?;
        Ok(self.status.map(|status| ServiceStatus::new(self.name, status)))
    }

    async fn instance_dropped(&self, _instance: &Instance) -> ControlResult<Option<()>> {
        self.record(HookName::InstanceDropped)?;
        Ok(self.claims.then_some(()))
    }
}
