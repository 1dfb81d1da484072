//! Desired-state manifests supplied by callers.

use crate::pgconf::Settings;
use serde::{Deserialize, Serialize};

/// Desired runtime state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Started,
    Stopped,
    Absent,
}

/// Replication source of a standby
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbySpec {
    pub primary_conninfo: String,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Per-instance overrides of authentication methods
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOverrides {
    pub local: Option<String>,
    pub host: Option<String>,
}

/// HA coordinator options; presence enables the coordinator for the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatroniOptions {
    pub cluster: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub restapi_listen: Option<String>,
}

/// Backup options; presence enables archiving for the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgBackRestOptions {
    pub stanza: String,
}

/// What the caller wants an instance to look like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub state: DesiredState,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub standby: Option<StandbySpec>,
    #[serde(default)]
    pub surole_password: Option<String>,
    #[serde(default)]
    pub auth: AuthOverrides,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub data_checksums: Option<bool>,
    #[serde(default)]
    pub patroni: Option<PatroniOptions>,
    #[serde(default)]
    pub pgbackrest: Option<PgBackRestOptions>,
    /// Restart instead of flagging a pending restart when needed
    #[serde(default)]
    pub restart_on_changes: bool,
}

fn default_port() -> u16 {
    5432
}

impl InstanceManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            port: default_port(),
            state: DesiredState::default(),
            settings: Settings::new(),
            standby: None,
            surole_password: None,
            auth: AuthOverrides::default(),
            locale: None,
            encoding: None,
            data_checksums: None,
            patroni: None,
            pgbackrest: None,
            restart_on_changes: false,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_state(mut self, state: DesiredState) -> Self {
        self.state = state;
        self
    }

    pub fn with_setting(
        mut self,
        name: impl Into<String>,
        value: impl Into<crate::pgconf::SettingValue>,
    ) -> Self {
        self.settings.insert(name.into(), value.into());
        self
    }

    pub fn with_standby(mut self, standby: StandbySpec) -> Self {
        self.standby = Some(standby);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    #[default]
    Present,
    Absent,
}

/// Desired state of a database inside an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseManifest {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Per-database `ALTER DATABASE .. SET` values
    #[serde(default)]
    pub settings: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub state: PresenceState,
    /// Terminate sessions when dropping
    #[serde(default)]
    pub force_drop: bool,
}

impl DatabaseManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            settings: Default::default(),
            state: PresenceState::Present,
            force_drop: false,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_setting(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(name.into(), value.into());
        self
    }

    pub fn absent(mut self) -> Self {
        self.state = PresenceState::Absent;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgconf::SettingValue;

    #[test]
    fn test_manifest_deserializes_with_defaults() {
        let manifest: InstanceManifest = serde_json::from_value(serde_json::json!({
            "name": "main",
            "settings": { "work_mem": "8MB", "max_connections": 50 },
            "standby": { "primary_conninfo": "host=primary port=5432" }
        }))
        .unwrap();
        assert_eq!(manifest.port, 5432);
        assert_eq!(manifest.state, DesiredState::Started);
        assert_eq!(manifest.settings["max_connections"], SettingValue::Int(50));
        assert!(manifest.standby.is_some());
        assert!(manifest.patroni.is_none());
    }
}
