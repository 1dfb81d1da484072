//! The system-side view of a PostgreSQL instance.

use super::manifest::{InstanceManifest, StandbySpec};
use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::pgconf::{PgConfFile, SettingValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of an instance on this host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub version: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(version: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
        }
    }

    /// Filesystem-safe identifier, `{version}-{name}`
    pub fn qualname(&self) -> String {
        format!("{}-{}", self.version, self.name)
    }

    pub fn from_manifest(manifest: &InstanceManifest, config: &ControlConfig) -> Self {
        Self::new(
            manifest
                .version
                .clone()
                .unwrap_or_else(|| config.postgresql.default_version.clone()),
            manifest.name.clone(),
        )
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.version, self.name)
    }
}

/// A PostgreSQL instance as laid out on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub key: InstanceKey,
    pub port: u16,
    pub datadir: PathBuf,
    pub waldir: PathBuf,
    pub bindir: PathBuf,
    pub socket_directory: PathBuf,
    pub standby: Option<StandbySpec>,
}

impl Instance {
    /// Where an instance with this key lives under the configured data root
    pub fn layout(key: &InstanceKey, config: &ControlConfig) -> (PathBuf, PathBuf) {
        let base = config
            .paths
            .data_root
            .join(&key.version)
            .join(&key.name);
        (base.join("data"), base.join("wal"))
    }

    /// Build the instance a manifest describes, without touching disk
    pub fn from_manifest(manifest: &InstanceManifest, config: &ControlConfig) -> Self {
        let key = InstanceKey::from_manifest(manifest, config);
        let (datadir, waldir) = Self::layout(&key, config);
        Self {
            bindir: config.postgresql.bindir(&key.version),
            key,
            port: manifest.port,
            datadir,
            waldir,
            socket_directory: config.postgresql.socket_directory.clone(),
            standby: manifest.standby.clone(),
        }
    }

    /// Inspect an existing instance.
    ///
    /// Port and replication source come from the instance's own configuration.
    pub async fn load(key: &InstanceKey, config: &ControlConfig) -> ControlResult<Self> {
        let (datadir, waldir) = Self::layout(key, config);
        if !Self::is_initialized(&datadir).await {
            return Err(ControlError::InstanceNotFound(key.to_string()));
        }

        let settings = PgConfFile::load(datadir.join("postgresql.conf"))
            .await?
            .effective();
        let port = match settings.get("port") {
            Some(SettingValue::Int(port)) => u16::try_from(*port).map_err(|_| {
                ControlError::invalid_state(key, format!("invalid port {port} in configuration"))
            })?,
            _ => 5432,
        };

        let standby = if tokio::fs::try_exists(datadir.join("standby.signal"))
            .await
            .unwrap_or(false)
        {
            Some(StandbySpec {
                primary_conninfo: settings
                    .get("primary_conninfo")
                    .and_then(SettingValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                slot: settings
                    .get("primary_slot_name")
                    .and_then(SettingValue::as_str)
                    .map(str::to_string),
                password: None,
            })
        } else {
            None
        };

        Ok(Self {
            key: key.clone(),
            port,
            datadir,
            waldir,
            bindir: config.postgresql.bindir(&key.version),
            socket_directory: config.postgresql.socket_directory.clone(),
            standby,
        })
    }

    /// Whether `datadir` holds an initialized cluster
    pub async fn is_initialized(datadir: &Path) -> bool {
        tokio::fs::try_exists(datadir.join("PG_VERSION"))
            .await
            .unwrap_or(false)
    }

    pub fn is_standby(&self) -> bool {
        self.standby.is_some()
    }

    pub fn qualname(&self) -> String {
        self.key.qualname()
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn version(&self) -> &str {
        &self.key.version
    }

    pub fn conf_path(&self) -> PathBuf {
        self.datadir.join("postgresql.conf")
    }

    pub fn bin(&self, program: &str) -> String {
        self.bindir.join(program).to_string_lossy().into_owned()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &Path) -> ControlConfig {
        let mut config = ControlConfig::default();
        config.paths.data_root = dir.to_path_buf();
        config
    }

    #[test]
    fn test_from_manifest_layout() {
        let config = ControlConfig::default();
        let manifest = InstanceManifest::new("main").with_port(5433);
        let instance = Instance::from_manifest(&manifest, &config);
        assert_eq!(instance.to_string(), "16/main");
        assert_eq!(instance.qualname(), "16-main");
        assert_eq!(
            instance.datadir,
            PathBuf::from("/var/lib/pgcontrol/16/main/data")
        );
        assert_eq!(instance.bin("pg_ctl"), "/usr/lib/postgresql/16/bin/pg_ctl");
    }

    #[tokio::test]
    async fn test_load_missing_instance() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let err = Instance::load(&InstanceKey::new("16", "ghost"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn test_load_reads_port_and_standby() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let key = InstanceKey::new("16", "replica");
        let (datadir, _) = Instance::layout(&key, &config);
        tokio::fs::create_dir_all(&datadir).await.unwrap();
        tokio::fs::write(datadir.join("PG_VERSION"), "16\n").await.unwrap();
        tokio::fs::write(datadir.join("standby.signal"), "").await.unwrap();
        tokio::fs::write(
            datadir.join("postgresql.conf"),
            "port = 5444\nprimary_conninfo = 'host=pg1 port=5432'\n",
        )
        .await
        .unwrap();

        let instance = Instance::load(&key, &config).await.unwrap();
        assert_eq!(instance.port, 5444);
        assert!(instance.is_standby());
        assert_eq!(
            instance.standby.unwrap().primary_conninfo,
            "host=pg1 port=5432"
        );
    }
}
