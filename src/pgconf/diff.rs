//! Change detection between two configurations.

use super::merge::{canonical_list, LIST_SETTINGS};
use super::{SettingValue, Settings};
use std::collections::BTreeMap;

/// Changed settings mapped to `(old, new)`; `None` means absent on that side
pub type ConfigChanges = BTreeMap<String, (Option<SettingValue>, Option<SettingValue>)>;

/// Settings that differ between `before` and `after`.
///
/// Values are compared in canonical form, so `1GB` against `1024MB` is not a
/// change, nor is `a,b` against `a, b` for list settings.
pub fn diff(before: &Settings, after: &Settings) -> ConfigChanges {
    let mut changes = ConfigChanges::new();
    for (name, old) in before {
        match after.get(name) {
            None => {
                changes.insert(name.clone(), (Some(old.clone()), None));
            }
            Some(new) if !same_setting(name, old, new) => {
                changes.insert(name.clone(), (Some(old.clone()), Some(new.clone())));
            }
            Some(_) => {}
        }
    }
    for (name, new) in after {
        if !before.contains_key(name) {
            changes.insert(name.clone(), (None, Some(new.clone())));
        }
    }
    changes
}

fn same_setting(name: &str, old: &SettingValue, new: &SettingValue) -> bool {
    if LIST_SETTINGS.contains(&name) {
        return canonical_list(old) == canonical_list(new);
    }
    old.same_as(new)
}

/// Apply changes on top of a configuration, the inverse of [`diff`]
pub fn apply_changes(settings: &Settings, changes: &ConfigChanges) -> Settings {
    let mut result = settings.clone();
    for (name, (_, new)) in changes {
        match new {
            Some(value) => {
                result.insert(name.clone(), value.clone());
            }
            None => {
                result.remove(name);
            }
        }
    }
    result
}

/// Changed settings that only take effect after a restart
pub fn restart_required(changes: &ConfigChanges, restart_keys: &[String]) -> Vec<String> {
    changes
        .keys()
        .filter(|name| restart_keys.iter().any(|key| key == *name))
        .cloned()
        .collect()
}
