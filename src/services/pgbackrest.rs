//! Backup service.
//!
//! Turns on WAL archiving through pgBackRest for instances whose manifest
//! names a stanza, and keeps one pgBackRest configuration file per instance.

use super::{remove_if_exists, write_if_changed};
use crate::config::{ControlConfig, PgBackRestConfig};
use crate::error::ControlResult;
use crate::models::{Instance, InstanceManifest};
use crate::pgconf::{ConfigChanges, SettingValue, Settings};
use crate::registry::{HookName, SatelliteService};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const SERVICE_NAME: &str = "pgbackrest";

const HOOKS: &[HookName] = &[
    HookName::InstanceSettings,
    HookName::PostgresqlConfigured,
    HookName::InstanceDropped,
];

pub struct PgBackRestService {
    config: Arc<ControlConfig>,
    settings: PgBackRestConfig,
}

impl PgBackRestService {
    pub fn new(config: Arc<ControlConfig>, settings: PgBackRestConfig) -> Self {
        Self { config, settings }
    }

    pub fn configpath(&self, instance: &Instance) -> PathBuf {
        self.settings
            .configdir
            .join(format!("{}.conf", instance.qualname()))
    }

    fn archive_command(&self, instance: &Instance, stanza: &str) -> String {
        format!(
            "{} --config={} --stanza={} archive-push %p",
            self.settings.execpath.display(),
            self.configpath(instance).display(),
            stanza
        )
    }

    /// INI content of the per-instance configuration
    pub fn render(&self, instance: &Instance, stanza: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[global]");
        let _ = writeln!(out, "repo1-path = {}", self.settings.repository.display());
        let _ = writeln!(
            out,
            "log-path = {}",
            self.config
                .paths
                .log_root
                .join(instance.qualname())
                .join("pgbackrest")
                .display()
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "[{stanza}]");
        let _ = writeln!(out, "pg1-path = {}", instance.datadir.display());
        let _ = writeln!(out, "pg1-port = {}", instance.port);
        let _ = writeln!(
            out,
            "pg1-socket-path = {}",
            instance.socket_directory.display()
        );
        let _ = writeln!(out, "pg1-user = {}", self.config.postgresql.surole.name);
        out
    }
}

#[async_trait]
impl SatelliteService for PgBackRestService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn hooks(&self) -> &'static [HookName] {
        HOOKS
    }

    async fn instance_settings(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<Option<Settings>> {
        let Some(options) = &manifest.pgbackrest else {
            return Ok(None);
        };
        let mut settings = Settings::new();
        settings.insert("archive_mode".into(), SettingValue::Bool(true));
        settings.insert(
            "archive_command".into(),
            SettingValue::Str(self.archive_command(instance, &options.stanza)),
        );
        settings.insert("wal_level".into(), "replica".into());
        Ok(Some(settings))
    }

    async fn postgresql_configured(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
        _changes: &ConfigChanges,
    ) -> ControlResult<Option<()>> {
        let Some(options) = &manifest.pgbackrest else {
            return Ok(None);
        };
        let path = self.configpath(instance);
        if write_if_changed(&path, &self.render(instance, &options.stanza)).await? {
            info!(instance = %instance, path = %path.display(), "pgBackRest configuration written");
        }
        Ok(Some(()))
    }

    async fn instance_dropped(&self, instance: &Instance) -> ControlResult<Option<()>> {
        let path = self.configpath(instance);
        if remove_if_exists(&path).await? {
            info!(instance = %instance, "pgBackRest configuration removed");
            return Ok(Some(()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PgBackRestOptions;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (PgBackRestService, InstanceManifest, Instance) {
        let mut config = ControlConfig::default();
        config.paths.data_root = dir.path().join("data");
        let settings = PgBackRestConfig {
            configdir: dir.path().join("pgbackrest"),
            ..PgBackRestConfig::default()
        };
        let config = Arc::new(config);
        let mut manifest = InstanceManifest::new("main");
        manifest.pgbackrest = Some(PgBackRestOptions {
            stanza: "main-stanza".to_string(),
        });
        let instance = Instance::from_manifest(&manifest, &config);
        (PgBackRestService::new(config, settings), manifest, instance)
    }

    #[tokio::test]
    async fn test_archiving_settings() {
        let dir = TempDir::new().unwrap();
        let (service, manifest, instance) = setup(&dir);
        let settings = service
            .instance_settings(&manifest, &instance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings["archive_mode"], SettingValue::Bool(true));
        assert_eq!(settings["wal_level"], SettingValue::from("replica"));
        let command = settings["archive_command"].raw();
        assert!(command.contains("--stanza=main-stanza"));
        assert!(command.ends_with("archive-push %p"));

        let plain = InstanceManifest::new("other");
        assert!(service
            .instance_settings(&plain, &instance)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_config_written_then_removed() {
        let dir = TempDir::new().unwrap();
        let (service, manifest, instance) = setup(&dir);
        service
            .postgresql_configured(&manifest, &instance, &ConfigChanges::new())
            .await
            .unwrap();
        let content = tokio::fs::read_to_string(service.configpath(&instance))
            .await
            .unwrap();
        assert!(content.contains("[main-stanza]"));
        assert!(content.contains("pg1-port = 5432"));

        assert!(service.instance_dropped(&instance).await.unwrap().is_some());
        assert!(service.instance_dropped(&instance).await.unwrap().is_none());
    }
}
