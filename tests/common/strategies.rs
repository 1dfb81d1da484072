use proptest::prelude::*;
use proptest::strategy::Just;
use pgcontrol_core::pgconf::{SettingValue, Settings};
use pgcontrol_core::registry::Priority;

/// Strategy for generating setting names, a few of them well known
pub fn setting_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("work_mem".to_string()),
        Just("max_connections".to_string()),
        Just("log_line_prefix".to_string()),
        Just("fsync".to_string()),
        "[a-z][a-z_]{0,20}",
    ]
}

/// Strategy for generating scalar setting values
pub fn setting_value_strategy() -> impl Strategy<Value = SettingValue> {
    prop_oneof![
        any::<bool>().prop_map(SettingValue::Bool),
        (-1000i64..100_000).prop_map(SettingValue::Int),
        "[a-z0-9]{1,8}".prop_map(SettingValue::Str),
        (1u32..4096, prop_oneof![Just("kB"), Just("MB"), Just("GB")])
            .prop_map(|(size, unit)| SettingValue::Str(format!("{size}{unit}"))),
    ]
}

/// Strategy for generating `shared_preload_libraries` values, with the
/// separator spacing people actually write
pub fn library_list_strategy() -> impl Strategy<Value = SettingValue> {
    prop::collection::vec(
        (
            prop_oneof![
                Just("pg_stat_statements"),
                Just("auto_explain"),
                Just("pg_cron"),
                Just("timescaledb"),
            ],
            prop_oneof![Just(","), Just(", "), Just(" ,"), Just(" , ")],
        ),
        0..4,
    )
    .prop_map(|libs| {
        let mut list = String::new();
        for (idx, (lib, separator)) in libs.iter().enumerate() {
            if idx > 0 {
                list.push_str(separator);
            }
            list.push_str(lib);
        }
        SettingValue::Str(list)
    })
}

/// Strategy for generating whole configurations
pub fn settings_strategy() -> impl Strategy<Value = Settings> {
    (
        prop::collection::btree_map(setting_name_strategy(), setting_value_strategy(), 0..12),
        prop::option::of(library_list_strategy()),
    )
        .prop_map(|(mut settings, libraries)| {
            if let Some(libraries) = libraries {
                settings.insert("shared_preload_libraries".to_string(), libraries);
            }
            settings
        })
}

/// Strategy for generating values of the standby floor settings
pub fn floor_settings_strategy() -> impl Strategy<Value = Settings> {
    prop::collection::btree_map(
        prop_oneof![
            Just("max_connections".to_string()),
            Just("max_wal_senders".to_string()),
            Just("max_worker_processes".to_string()),
            Just("max_locks_per_transaction".to_string()),
        ],
        (1i64..1000).prop_map(SettingValue::Int),
        0..4,
    )
}

/// Strategy for generating a pipeline length and the 1-based step that fails
pub fn pipeline_failure_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..8).prop_flat_map(|steps| (Just(steps), 1..=steps))
}

/// Strategy for generating the priorities services register with, in order
pub fn priority_sequence_strategy() -> impl Strategy<Value = Vec<Priority>> {
    prop::collection::vec(
        prop_oneof![Just(Priority::Normal), Just(Priority::RunLast)],
        0..8,
    )
}

/// Strategy for generating retry attempt limits
pub fn max_attempts_strategy() -> impl Strategy<Value = u32> {
    1u32..12
}
