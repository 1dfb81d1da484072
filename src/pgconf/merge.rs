//! Combining setting contributions into one effective configuration.

use super::{SettingValue, Settings};
use crate::config::ConfigurationError;
use tracing::debug;

/// Settings whose values are comma-separated lists merged by union
pub const LIST_SETTINGS: [&str; 1] = ["shared_preload_libraries"];

/// Settings a standby must keep at or above the primary's value
pub const STANDBY_FLOOR_KEYS: [&str; 5] = [
    "max_connections",
    "max_prepared_transactions",
    "max_locks_per_transaction",
    "max_wal_senders",
    "max_worker_processes",
];

/// Settings that may be expressed as a percentage of host memory
pub const MEMORY_PERCENT_SETTINGS: [&str; 2] = ["shared_buffers", "effective_cache_size"];

/// Merge contributions over a base configuration.
///
/// Scalars from later contributions replace earlier values. List settings are
/// unioned preserving first-seen order, so merging the same contributions
/// twice yields the same result.
pub fn merge(base: &Settings, contributions: &[Settings]) -> Settings {
    let mut merged = base.clone();
    for contribution in contributions {
        for (name, value) in contribution {
            let combined = if LIST_SETTINGS.contains(&name.as_str()) {
                let existing = merged.get(name).map(list_text).unwrap_or_default();
                SettingValue::Str(merge_lists(&existing, &list_text(value)))
            } else {
                value.clone()
            };
            merged.insert(name.clone(), combined);
        }
    }
    merged
}

/// Union of two comma-separated lists, first occurrence wins
pub fn merge_lists(left: &str, right: &str) -> String {
    let mut items: Vec<&str> = Vec::new();
    for item in left.split(',').chain(right.split(',')) {
        let item = item.trim();
        if !item.is_empty() && !items.contains(&item) {
            items.push(item);
        }
    }
    items.join(", ")
}

/// Items of a list value joined without padding, for comparison
pub fn canonical_list(value: &SettingValue) -> String {
    list_text(value)
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn list_text(value: &SettingValue) -> String {
    match value {
        SettingValue::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Raise standby settings that fall below the primary's values.
///
/// Keys missing on the standby are copied from the primary. Non-numeric
/// values are left alone. Returns the keys that were raised.
pub fn enforce_standby_floor(
    settings: &mut Settings,
    primary: &Settings,
    floor_keys: &[String],
) -> Vec<String> {
    let mut raised = Vec::new();
    for key in floor_keys {
        let Some(floor) = primary.get(key) else {
            continue;
        };
        let below = match settings.get(key) {
            None => true,
            Some(current) => match (current.as_number(), floor.as_number()) {
                (Some(current), Some(floor)) => current < floor,
                _ => false,
            },
        };
        if below {
            debug!(setting = %key, floor = %floor, "raising standby setting to primary value");
            settings.insert(key.clone(), floor.clone());
            raised.push(key.clone());
        }
    }
    raised
}

/// Replace `NN%` memory settings with an absolute size in kB
pub fn resolve_memory_percentages(
    settings: &mut Settings,
    total_memory_bytes: u64,
) -> Result<(), ConfigurationError> {
    for key in MEMORY_PERCENT_SETTINGS {
        let Some(SettingValue::Str(raw)) = settings.get(key) else {
            continue;
        };
        let Some(percent) = raw.trim().strip_suffix('%') else {
            continue;
        };
        let percent: f64 = percent.trim().parse().map_err(|_| {
            ConfigurationError::invalid_setting(key, format!("invalid percentage '{raw}'"))
        })?;
        if !(0.0..=100.0).contains(&percent) {
            return Err(ConfigurationError::invalid_setting(
                key,
                format!("percentage {percent} out of range"),
            ));
        }
        let kilobytes = (total_memory_bytes as f64 * percent / 100.0 / 1024.0) as u64;
        settings.insert(key.to_string(), SettingValue::Str(format!("{kilobytes}kB")));
    }
    Ok(())
}
