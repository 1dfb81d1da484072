//! Log shipping service.
//!
//! Sends PostgreSQL logs to syslog under a per-instance ident and routes them
//! into a per-instance file with an rsyslog snippet.

use super::{remove_if_exists, write_if_changed};
use crate::config::{ControlConfig, RsyslogConfig};
use crate::error::ControlResult;
use crate::models::{Instance, InstanceManifest};
use crate::pgconf::{ConfigChanges, SettingValue, Settings};
use crate::registry::{HookName, SatelliteService};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const SERVICE_NAME: &str = "rsyslog";

const HOOKS: &[HookName] = &[
    HookName::InstanceSettings,
    HookName::PostgresqlConfigured,
    HookName::InstanceDropped,
];

pub struct RsyslogService {
    config: Arc<ControlConfig>,
    settings: RsyslogConfig,
}

impl RsyslogService {
    pub fn new(config: Arc<ControlConfig>, settings: RsyslogConfig) -> Self {
        Self { config, settings }
    }

    pub fn ident(&self, instance: &Instance) -> String {
        format!("{}-{}", self.settings.ident_prefix, instance.qualname())
    }

    pub fn snippet_path(&self, instance: &Instance) -> PathBuf {
        self.settings
            .configdir
            .join(format!("pgcontrol-{}.conf", instance.qualname()))
    }

    fn logfile(&self, instance: &Instance) -> PathBuf {
        self.config
            .paths
            .log_root
            .join(instance.qualname())
            .join("postgresql.log")
    }

    fn snippet(&self, instance: &Instance) -> String {
        format!(
            "if $programname == '{}' then {}\n& stop\n",
            self.ident(instance),
            self.logfile(instance).display()
        )
    }
}

#[async_trait]
impl SatelliteService for RsyslogService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn hooks(&self) -> &'static [HookName] {
        HOOKS
    }

    async fn instance_settings(
        &self,
        _manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<Option<Settings>> {
        let mut settings = Settings::new();
        settings.insert("log_destination".into(), "syslog".into());
        settings.insert(
            "syslog_ident".into(),
            SettingValue::Str(self.ident(instance)),
        );
        if self.settings.auto_explain {
            settings.insert("shared_preload_libraries".into(), "auto_explain".into());
        }
        Ok(Some(settings))
    }

    async fn postgresql_configured(
        &self,
        _manifest: &InstanceManifest,
        instance: &Instance,
        _changes: &ConfigChanges,
    ) -> ControlResult<Option<()>> {
        let path = self.snippet_path(instance);
        if write_if_changed(&path, &self.snippet(instance)).await? {
            info!(instance = %instance, path = %path.display(), "rsyslog snippet written");
        }
        Ok(Some(()))
    }

    async fn instance_dropped(&self, instance: &Instance) -> ControlResult<Option<()>> {
        if remove_if_exists(&self.snippet_path(instance)).await? {
            info!(instance = %instance, "rsyslog snippet removed");
            return Ok(Some(()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_settings_and_snippet() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(ControlConfig::default());
        let service = RsyslogService::new(
            config.clone(),
            RsyslogConfig {
                configdir: dir.path().to_path_buf(),
                auto_explain: true,
                ..RsyslogConfig::default()
            },
        );
        let manifest = InstanceManifest::new("main");
        let instance = Instance::from_manifest(&manifest, &config);

        let settings = service
            .instance_settings(&manifest, &instance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings["syslog_ident"], SettingValue::from("postgresql-16-main"));
        assert_eq!(
            settings["shared_preload_libraries"],
            SettingValue::from("auto_explain")
        );

        service
            .postgresql_configured(&manifest, &instance, &ConfigChanges::new())
            .await
            .unwrap();
        let snippet = tokio::fs::read_to_string(service.snippet_path(&instance))
            .await
            .unwrap();
        assert!(snippet.starts_with("if $programname == 'postgresql-16-main'"));

        assert!(service.instance_dropped(&instance).await.unwrap().is_some());
        assert!(!service.snippet_path(&instance).exists());
    }
}
