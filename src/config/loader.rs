//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Sources are layered
//! in order: `pgcontrol.toml`, `pgcontrol.{environment}.toml`, then
//! `PGCONTROL__SECTION__FIELD` environment variables. Missing files are fine;
//! every section has defaults.

use super::error::{ConfigResult, ConfigurationError};
use super::ControlConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE: &str = "pgcontrol.toml";
const ENV_PREFIX: &str = "PGCONTROL";
const SENSITIVE_PATTERNS: [&str; 5] = ["password", "secret", "token", "credential", "key"];

pub struct ConfigManager {
    config: ControlConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    ///
    /// Useful in tests, where mutating process environment is racy.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_layered(&config_directory, environment)?;
        config.validate()?;

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = %environment,
            data_root = %config.paths.data_root.display(),
            default_version = %config.postgresql.default_version,
            patroni = config.patroni.is_some(),
            pgbackrest = config.pgbackrest.is_some(),
            rsyslog = config.rsyslog.is_some(),
            "Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration
    pub fn from_config(config: ControlConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with sensitive fields masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    fn load_layered(config_directory: &Path, environment: &str) -> ConfigResult<ControlConfig> {
        let base = config_directory.join(BASE_FILE);
        let overlay = config_directory.join(format!("pgcontrol.{environment}.toml"));

        let settings = config::Config::builder()
            .add_source(
                config::File::new(&base.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::File::new(&overlay.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(config_directory.display().to_string(), e))?;

        settings
            .try_deserialize::<ControlConfig>()
            .map_err(|e| ConfigurationError::load_error(config_directory.display().to_string(), e))
    }

    fn detect_environment() -> String {
        env::var("PGCONTROL_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("PGCONTROL_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/pgcontrol"))
    }

    fn sanitize_config_for_logging(config: &ControlConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        Self::sanitize_json_recursive(&mut config_json, &SENSITIVE_PATTERNS);
        config_json
    }

    /// Recursively mask values whose key matches a sensitive pattern
    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if !is_sensitive {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                        continue;
                    }

                    *val = match val {
                        serde_json::Value::Null => serde_json::Value::Null,
                        serde_json::Value::String(s) if s.is_empty() => {
                            serde_json::Value::String("[EMPTY]".to_string())
                        }
                        serde_json::Value::String(s) => {
                            // First and last two characters only
                            let masked = if s.chars().count() > 4 {
                                let chars: Vec<char> = s.chars().collect();
                                format!(
                                    "{}{}***{}{}",
                                    chars[0],
                                    chars[1],
                                    chars[chars.len() - 2],
                                    chars[chars.len() - 1]
                                )
                            } else {
                                "***".to_string()
                            };
                            serde_json::Value::String(format!("[MASKED: {masked}]"))
                        }
                        _ => serde_json::Value::String("[MASKED]".to_string()),
                    };
                }
            }
            serde_json::Value::Array(arr) => {
                for item in arr.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}
