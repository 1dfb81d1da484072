//! # PostgreSQL Configuration Engine
//!
//! Typed setting values, merging of contributions from satellite services,
//! change detection, and `postgresql.conf` persistence.
//!
//! ```rust
//! use pgcontrol_core::pgconf::{diff, merge, SettingValue, Settings};
//!
//! let mut base = Settings::new();
//! base.insert("shared_preload_libraries".into(), "pg_stat_statements".into());
//! let mut contribution = Settings::new();
//! contribution.insert("shared_preload_libraries".into(), "auto_explain".into());
//!
//! let merged = merge(&base, &[contribution]);
//! assert_eq!(
//!     merged["shared_preload_libraries"],
//!     SettingValue::from("pg_stat_statements, auto_explain")
//! );
//! assert_eq!(diff(&base, &merged).len(), 1);
//! ```

pub mod diff;
pub mod file;
pub mod memory;
pub mod merge;
pub mod value;

use std::collections::BTreeMap;

pub use diff::{apply_changes, diff, restart_required, ConfigChanges};
pub use file::{apply_configuration, ApplyMode, PgConfFile};
pub use memory::{FixedMemory, HostMemory, SystemMemory};
pub use merge::{
    enforce_standby_floor, merge, merge_lists, resolve_memory_percentages, STANDBY_FLOOR_KEYS,
};
pub use value::SettingValue;

/// Setting name to value, ordered by name
pub type Settings = BTreeMap<String, SettingValue>;
