//! # Satellite Services
//!
//! Concrete [`SatelliteService`] implementations and the registry wiring used
//! at startup. Optional services are registered only when their configuration
//! section is present; the built-in PostgreSQL service always goes last.

pub mod patroni;
pub mod pgbackrest;
pub mod postgresql;
pub mod rsyslog;

pub use patroni::PatroniService;
pub use pgbackrest::PgBackRestService;
pub use postgresql::PostgresqlService;
pub use rsyslog::RsyslogService;

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::orchestration::process::ProcessRunner;
use crate::registry::{HookRegistry, Priority, SatelliteService};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Registry with every configured service, frozen
pub async fn default_registry(
    config: Arc<ControlConfig>,
    runner: Arc<dyn ProcessRunner>,
) -> ControlResult<Arc<HookRegistry>> {
    let registry = HookRegistry::new();

    if let Some(settings) = config.patroni.clone() {
        let service = PatroniService::new(config.clone(), settings, runner.clone()).await?;
        registry.register(Arc::new(service), Priority::Normal)?;
    }
    if let Some(settings) = config.pgbackrest.clone() {
        registry.register(
            Arc::new(PgBackRestService::new(config.clone(), settings)),
            Priority::Normal,
        )?;
    }
    if let Some(settings) = config.rsyslog.clone() {
        registry.register(
            Arc::new(RsyslogService::new(config.clone(), settings)),
            Priority::Normal,
        )?;
    }
    let builtin: Arc<dyn SatelliteService> = Arc::new(PostgresqlService::new(config, runner));
    registry.register(builtin, Priority::RunLast)?;

    let registry = registry.freeze();
    info!(registry = ?registry, "satellite services registered");
    Ok(registry)
}

/// Write `content` unless the file already holds it; true when written
pub(crate) async fn write_if_changed(path: &Path, content: &str) -> ControlResult<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(current) if current == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ControlError::io(path, e)),
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ControlError::io(parent, e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ControlError::io(path, e))?;
    Ok(true)
}

/// Remove a file; true when it existed
pub(crate) async fn remove_if_exists(path: &Path) -> ControlResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ControlError::io(path, e)),
    }
}
