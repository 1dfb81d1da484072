//! # pgcontrol Configuration System
//!
//! Site-wide settings for the reconciliation core: filesystem layout, the
//! PostgreSQL defaults applied to every instance, retry policies for readiness
//! waits, and the optional satellite service sections.
//!
//! ## Architecture
//!
//! - **Layered sources**: `pgcontrol.toml`, then `pgcontrol.{env}.toml`, then
//!   `PGCONTROL__*` environment variables
//! - **Complete defaults**: every section deserializes from nothing
//! - **Explicit validation**: invalid values fail loading instead of degrading
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pgcontrol_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let bindir = manager.config().postgresql.bindir("16");
//! # let _ = bindir;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::pgconf::Settings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub paths: PathsConfig,
    pub postgresql: PostgresqlConfig,
    pub retry: RetryConfig,
    pub patroni: Option<PatroniConfig>,
    pub pgbackrest: Option<PgBackRestConfig>,
    pub rsyslog: Option<RsyslogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Instances live under `{data_root}/{version}/{name}`
    pub data_root: PathBuf,
    pub log_root: PathBuf,
    /// Pid files and other runtime state
    pub run_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/pgcontrol"),
            log_root: PathBuf::from("/var/log/pgcontrol"),
            run_root: PathBuf::from("/run/pgcontrol"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresqlConfig {
    /// Binary directory template, `{version}` is substituted
    pub bindir: String,
    pub default_version: String,
    pub socket_directory: PathBuf,
    /// Directory for `pg_ctl start` log files; unset disables start logs
    pub logpath: Option<PathBuf>,
    pub surole: RoleConfig,
    pub replrole: String,
    pub auth: AuthConfig,
    pub initdb: InitdbConfig,
    /// Site defaults written to every instance before manifest settings
    pub settings: Settings,
    /// Settings a standby never lowers below the primary's value
    pub standby_floor_keys: Vec<String>,
    /// Settings whose change needs a restart rather than a reload
    pub restart_required_keys: Vec<String>,
}

impl Default for PostgresqlConfig {
    fn default() -> Self {
        Self {
            bindir: "/usr/lib/postgresql/{version}/bin".to_string(),
            default_version: "16".to_string(),
            socket_directory: PathBuf::from("/run/postgresql"),
            logpath: None,
            surole: RoleConfig::default(),
            replrole: "replication".to_string(),
            auth: AuthConfig::default(),
            initdb: InitdbConfig::default(),
            settings: Settings::new(),
            standby_floor_keys: crate::pgconf::STANDBY_FLOOR_KEYS
                .iter()
                .map(|key| key.to_string())
                .collect(),
            restart_required_keys: [
                "shared_buffers",
                "max_connections",
                "port",
                "shared_preload_libraries",
                "max_wal_senders",
                "max_worker_processes",
                "max_prepared_transactions",
                "max_locks_per_transaction",
                "wal_level",
                "listen_addresses",
            ]
            .iter()
            .map(|key| key.to_string())
            .collect(),
        }
    }
}

impl PostgresqlConfig {
    /// Binary directory for a PostgreSQL major version
    pub fn bindir(&self, version: &str) -> PathBuf {
        PathBuf::from(self.bindir.replace("{version}", version))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoleConfig {
    pub name: String,
    pub password: Option<String>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            name: "postgres".to_string(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub local: String,
    pub host: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            local: "trust".to_string(),
            host: "trust".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InitdbConfig {
    pub locale: Option<String>,
    pub encoding: Option<String>,
    pub data_checksums: bool,
}

/// Serializable form of a retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
    pub deadline_ms: Option<u64>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
            max_interval_ms: 10_000,
            multiplier: 2.0,
            max_attempts: None,
            deadline_ms: Some(60_000),
        }
    }
}

impl RetryPolicyConfig {
    fn validate(&self, field: &str) -> ConfigResult<()> {
        if self.min_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.min_interval_ms"),
                "0",
                "interval must be greater than 0",
            ));
        }
        if self.max_interval_ms < self.min_interval_ms {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.max_interval_ms"),
                self.max_interval_ms.to_string(),
                "must not be lower than min_interval_ms",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.multiplier"),
                self.multiplier.to_string(),
                "multiplier must be at least 1.0",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.max_attempts"),
                "0",
                "at least one attempt is required",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Waiting for PostgreSQL to accept connections
    pub instance_ready: RetryPolicyConfig,
    /// Waiting for the HA coordinator to report the instance ready
    pub coordinator_ready: RetryPolicyConfig,
    /// Waiting for the HA coordinator API to go away
    pub coordinator_down: RetryPolicyConfig,
    /// Waiting for a log file to appear
    pub logfile_wait: RetryPolicyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            instance_ready: RetryPolicyConfig {
                min_interval_ms: 500,
                max_interval_ms: 5_000,
                ..RetryPolicyConfig::default()
            },
            coordinator_ready: RetryPolicyConfig {
                deadline_ms: Some(300_000),
                ..RetryPolicyConfig::default()
            },
            coordinator_down: RetryPolicyConfig {
                min_interval_ms: 1_000,
                max_interval_ms: 1_000,
                multiplier: 1.0,
                max_attempts: None,
                deadline_ms: Some(60_000),
            },
            logfile_wait: RetryPolicyConfig {
                max_attempts: Some(5),
                deadline_ms: None,
                ..RetryPolicyConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatroniConfig {
    pub execpath: PathBuf,
    /// Holds `{qualname}.yaml` per instance
    pub configdir: PathBuf,
    /// Holds `{qualname}/patroni.log` per instance
    pub logdir: PathBuf,
    /// Timestamped copies of the last member's configuration on drop
    pub backupdir: Option<PathBuf>,
    pub restapi: RestApiConfig,
    pub etcd_hosts: Vec<String>,
    pub loop_wait: u32,
}

impl Default for PatroniConfig {
    fn default() -> Self {
        Self {
            execpath: PathBuf::from("/usr/bin/patroni"),
            configdir: PathBuf::from("/etc/patroni"),
            logdir: PathBuf::from("/var/log/patroni"),
            backupdir: None,
            restapi: RestApiConfig::default(),
            etcd_hosts: vec!["127.0.0.1:2379".to_string()],
            loop_wait: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestApiConfig {
    pub listen: String,
    pub cafile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8008".to_string(),
            cafile: None,
            certfile: None,
            keyfile: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PgBackRestConfig {
    pub execpath: PathBuf,
    pub configdir: PathBuf,
    pub repository: PathBuf,
}

impl Default for PgBackRestConfig {
    fn default() -> Self {
        Self {
            execpath: PathBuf::from("/usr/bin/pgbackrest"),
            configdir: PathBuf::from("/etc/pgbackrest/conf.d"),
            repository: PathBuf::from("/var/lib/pgbackrest"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RsyslogConfig {
    pub configdir: PathBuf,
    pub ident_prefix: String,
    pub auto_explain: bool,
}

impl Default for RsyslogConfig {
    fn default() -> Self {
        Self {
            configdir: PathBuf::from("/etc/rsyslog.d"),
            ident_prefix: "postgresql".to_string(),
            auto_explain: false,
        }
    }
}

impl ControlConfig {
    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.postgresql.bindir.contains("{version}") {
            return Err(ConfigurationError::invalid_value(
                "postgresql.bindir",
                self.postgresql.bindir.clone(),
                "template must contain {version}",
            ));
        }

        if self.postgresql.default_version.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "postgresql.default_version",
                "postgresql configuration",
            ));
        }

        if self.postgresql.surole.name.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "postgresql.surole.name",
                "postgresql configuration",
            ));
        }

        for (name, value) in &self.postgresql.settings {
            if name.trim().is_empty() {
                return Err(ConfigurationError::invalid_setting(
                    name.clone(),
                    format!("empty setting name for value {value}"),
                ));
            }
        }

        self.retry.instance_ready.validate("retry.instance_ready")?;
        self.retry
            .coordinator_ready
            .validate("retry.coordinator_ready")?;
        self.retry.coordinator_down.validate("retry.coordinator_down")?;
        self.retry.logfile_wait.validate("retry.logfile_wait")?;

        if let Some(patroni) = &self.patroni {
            if patroni.etcd_hosts.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "patroni.etcd_hosts",
                    "patroni configuration",
                ));
            }
            if patroni.restapi.certfile.is_some() != patroni.restapi.keyfile.is_some() {
                return Err(ConfigurationError::validation_error(
                    "patroni.restapi.certfile and patroni.restapi.keyfile must be set together",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgconf::SettingValue;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.patroni.is_none());
        assert_eq!(
            config.postgresql.bindir("15"),
            PathBuf::from("/usr/lib/postgresql/15/bin")
        );
    }

    #[test]
    fn test_rejects_bindir_without_version_placeholder() {
        let mut config = ControlConfig::default();
        config.postgresql.bindir = "/usr/bin".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_zero_attempt_policy() {
        let mut config = ControlConfig::default();
        config.retry.logfile_wait.max_attempts = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.logfile_wait.max_attempts"));
    }

    #[test]
    fn test_patroni_tls_pair_required() {
        let mut config = ControlConfig::default();
        let mut patroni = PatroniConfig::default();
        patroni.restapi.certfile = Some(PathBuf::from("/etc/ssl/patroni.pem"));
        config.patroni = Some(patroni);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_site_settings_deserialize_typed() {
        let config: ControlConfig = serde_json::from_value(serde_json::json!({
            "postgresql": {
                "settings": { "max_connections": 200, "log_line_prefix": "%m [%p] " }
            }
        }))
        .unwrap();
        assert_eq!(
            config.postgresql.settings.get("max_connections"),
            Some(&SettingValue::Int(200))
        );
        assert_eq!(config.paths, PathsConfig::default());
    }
}
