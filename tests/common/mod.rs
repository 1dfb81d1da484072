//! Shared fixtures for the integration tests.
#![allow(dead_code)]

pub mod runner;
pub mod services;
pub mod strategies;

pub use runner::*;
pub use services::*;

use pgcontrol_core::config::{ControlConfig, RetryPolicyConfig};
use pgcontrol_core::orchestration::ProcessRunner;
use pgcontrol_core::pgconf::FixedMemory;
use pgcontrol_core::registry::{HookRegistry, Priority, SatelliteService};
use pgcontrol_core::services::PostgresqlService;
use pgcontrol_core::Orchestrator;
use std::path::Path;
use std::sync::Arc;

/// Configuration with every path under `root` and fast readiness polling
pub fn test_config(root: &Path) -> ControlConfig {
    let mut config = ControlConfig::default();
    config.paths.data_root = root.join("data");
    config.paths.log_root = root.join("log");
    config.paths.run_root = root.join("run");
    config.postgresql.socket_directory = root.join("run");
    config.retry.instance_ready = RetryPolicyConfig {
        min_interval_ms: 10,
        max_interval_ms: 10,
        multiplier: 1.0,
        max_attempts: Some(3),
        deadline_ms: None,
    };
    config
}

/// Orchestrator over the built-in service driven by `runner`, with `extra`
/// services registered ahead of it
pub fn orchestrator(
    config: ControlConfig,
    runner: Arc<ScriptedRunner>,
    extra: Vec<Arc<dyn SatelliteService>>,
) -> Orchestrator {
    let config = Arc::new(config);
    let registry = HookRegistry::new();
    for service in extra {
        registry.register(service, Priority::Normal).unwrap();
    }
    let runner: Arc<dyn ProcessRunner> = runner;
    registry
        .register(
            Arc::new(PostgresqlService::new(config.clone(), runner)),
            Priority::RunLast,
        )
        .unwrap();
    Orchestrator::new(config, registry.freeze())
        .with_memory(Arc::new(FixedMemory(8 * 1024 * 1024 * 1024)))
}
