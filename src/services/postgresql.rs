//! Built-in PostgreSQL service.
//!
//! Drives `initdb`, `pg_basebackup` and `pg_ctl` directly. Registered as
//! run-last so that a satellite owning the instance lifecycle answers the
//! first-non-null hooks before it.

use crate::config::ControlConfig;
use crate::db;
use crate::error::{ControlError, ControlResult};
use crate::models::{
    Instance, InstanceManifest, RunStatus, ServiceStatus, StartOptions, StopMode, StopOptions,
};
use crate::orchestration::log_follow::follow_during;
use crate::orchestration::process::{CommandSpec, ProcessRunner};
use crate::orchestration::retry::{poll_until_ready, ProbeOutcome, RetryPolicy};
use crate::pgconf::{apply_configuration, ApplyMode, ConfigChanges, Settings};
use crate::registry::{HookName, SatelliteService};
use async_trait::async_trait;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const SERVICE_NAME: &str = "postgresql";

const HOOKS: &[HookName] = &[
    HookName::InitPostgresql,
    HookName::ConfigurePostgresql,
    HookName::ConfigureAuth,
    HookName::StartPostgresql,
    HookName::StopPostgresql,
    HookName::RestartPostgresql,
    HookName::ReloadPostgresql,
    HookName::PromotePostgresql,
    HookName::InstanceStatus,
    HookName::InstanceDropped,
];

pub struct PostgresqlService {
    config: Arc<ControlConfig>,
    runner: Arc<dyn ProcessRunner>,
}

impl PostgresqlService {
    pub fn new(config: Arc<ControlConfig>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    fn start_logfile(&self, instance: &Instance) -> Option<PathBuf> {
        self.config
            .postgresql
            .logpath
            .as_ref()
            .map(|dir| dir.join(format!("{}-start.log", instance.qualname())))
    }

    fn pg_ctl(instance: &Instance, action: &str) -> CommandSpec {
        CommandSpec::new([
            instance.bin("pg_ctl"),
            action.to_string(),
            "-D".to_string(),
            path_arg(&instance.datadir),
        ])
    }

    /// `pg_ctl status`: 0 running, 3 not running, 4 no usable data directory
    pub async fn status(&self, instance: &Instance) -> ControlResult<RunStatus> {
        let output = self
            .runner
            .run(&Self::pg_ctl(instance, "status").check(false))
            .await?;
        Ok(match output.returncode {
            0 => RunStatus::Running,
            3 => RunStatus::NotRunning,
            _ => RunStatus::Unknown,
        })
    }

    pub async fn probe_ready(&self, instance: &Instance) -> ProbeOutcome<()> {
        pg_isready(self.runner.as_ref(), instance, &self.config.postgresql.surole.name).await
    }

    pub async fn wait_ready(&self, instance: &Instance) -> ControlResult<()> {
        let policy = RetryPolicy::from(&self.config.retry.instance_ready);
        poll_until_ready(&format!("waiting for {instance} to accept connections"), &policy, || {
            self.probe_ready(instance)
        })
        .await
    }

    async fn initdb(&self, manifest: &InstanceManifest, instance: &Instance) -> ControlResult<()> {
        let pg = &self.config.postgresql;
        let mut spec = CommandSpec::new([
            instance.bin("initdb"),
            "--pgdata".to_string(),
            path_arg(&instance.datadir),
            "--waldir".to_string(),
            path_arg(&instance.waldir),
            "--username".to_string(),
            pg.surole.name.clone(),
            "--auth-local".to_string(),
            manifest.auth.local.clone().unwrap_or_else(|| pg.auth.local.clone()),
            "--auth-host".to_string(),
            manifest.auth.host.clone().unwrap_or_else(|| pg.auth.host.clone()),
        ]);
        if let Some(locale) = manifest.locale.as_ref().or(pg.initdb.locale.as_ref()) {
            spec = spec.arg(format!("--locale={locale}"));
        }
        if let Some(encoding) = manifest.encoding.as_ref().or(pg.initdb.encoding.as_ref()) {
            spec = spec.arg(format!("--encoding={encoding}"));
        }
        if manifest.data_checksums.unwrap_or(pg.initdb.data_checksums) {
            spec = spec.arg("--data-checksums");
        }

        let password = manifest
            .surole_password
            .as_ref()
            .or(pg.surole.password.as_ref());
        let Some(password) = password else {
            self.runner.run(&spec).await?;
            return Ok(());
        };

        // Keep the password off the command line
        let pwfile = instance
            .datadir
            .parent()
            .unwrap_or(&instance.datadir)
            .join(".pwfile");
        write_private(&pwfile, &format!("{password}\n")).await?;
        let result = self
            .runner
            .run(&spec.arg(format!("--pwfile={}", pwfile.display())))
            .await;
        if let Err(e) = tokio::fs::remove_file(&pwfile).await {
            warn!(path = %pwfile.display(), error = %e, "failed to remove password file");
        }
        result.map(|_| ())
    }

    async fn basebackup(&self, instance: &Instance) -> ControlResult<()> {
        let Some(standby) = &instance.standby else {
            return Err(ControlError::invalid_state(instance, "not a standby"));
        };
        let mut spec = CommandSpec::new([
            instance.bin("pg_basebackup"),
            "--pgdata".to_string(),
            path_arg(&instance.datadir),
            "--write-recovery-conf".to_string(),
            "--checkpoint=fast".to_string(),
            "--no-password".to_string(),
            "--waldir".to_string(),
            path_arg(&instance.waldir),
            "--dbname".to_string(),
            standby.primary_conninfo.clone(),
        ]);
        if let Some(slot) = &standby.slot {
            spec = spec.arg("--slot").arg(slot.clone());
        }
        if let Some(password) = &standby.password {
            spec = spec.env("PGPASSWORD", password.clone());
        }
        info!(instance = %instance, "creating standby from base backup");
        self.runner.run(&spec).await?;
        Ok(())
    }

    fn hba_content(&self, manifest: &InstanceManifest) -> String {
        let pg = &self.config.postgresql;
        let local = manifest.auth.local.as_deref().unwrap_or(&pg.auth.local);
        let host = manifest.auth.host.as_deref().unwrap_or(&pg.auth.host);
        let replrole = &pg.replrole;
        format!(
            "# TYPE  DATABASE        USER            ADDRESS                 METHOD\n\
             local   all             all                                     {local}\n\
             host    all             all             127.0.0.1/32            {host}\n\
             host    all             all             ::1/128                 {host}\n\
             local   replication     all                                     {local}\n\
             host    replication     {replrole:<15} 127.0.0.1/32            {host}\n\
             host    replication     {replrole:<15} ::1/128                 {host}\n"
        )
    }

    async fn pg_ctl_start(&self, instance: &Instance, options: &StartOptions) -> ControlResult<()> {
        let mut spec = Self::pg_ctl(instance, "start");
        let parameters = options
            .runtime_parameters
            .iter()
            .map(|(name, value)| format!("-c {name}={value}"))
            .collect::<Vec<_>>();
        if !parameters.is_empty() {
            spec = spec.arg("-o").arg(parameters.join(" "));
        }
        spec = spec.arg(if options.wait { "--wait" } else { "--no-wait" });

        let Some(logfile) = self.start_logfile(instance) else {
            // Without -l the server inherits pg_ctl's stdout
            self.runner.run(&spec.capture_output(false)).await?;
            return Ok(());
        };

        spec = spec.arg("-l").arg(path_arg(&logfile));
        let (result, report) = follow_during(&logfile, "postgres", self.runner.run(&spec)).await;
        if let Err(e) = &result {
            for line in &report.lines {
                warn!(instance = %instance, "{line}");
            }
            warn!(instance = %instance, error = %e, "failed to start PostgreSQL");
        }
        result.map(|_| ())
    }
}

#[async_trait]
impl SatelliteService for PostgresqlService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn hooks(&self) -> &'static [HookName] {
        HOOKS
    }

    async fn init_postgresql(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<Option<bool>> {
        if Instance::is_initialized(&instance.datadir).await {
            debug!(instance = %instance, "data directory already initialized");
            return Ok(Some(false));
        }
        if instance.is_standby() {
            self.basebackup(instance).await?;
        } else {
            self.initdb(manifest, instance).await?;
        }
        Ok(Some(true))
    }

    async fn configure_postgresql(
        &self,
        configuration: &Settings,
        _manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<Option<ConfigChanges>> {
        let mode = if instance.is_standby() {
            ApplyMode::Merge {
                primary_snapshot: None,
                floor_keys: &self.config.postgresql.standby_floor_keys,
            }
        } else {
            ApplyMode::Replace
        };
        let changes = apply_configuration(&instance.conf_path(), configuration, mode).await?;
        Ok(Some(changes))
    }

    async fn configure_auth(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<Option<bool>> {
        let hba = instance.datadir.join("pg_hba.conf");
        tokio::fs::write(&hba, self.hba_content(manifest))
            .await
            .map_err(|e| ControlError::io(&hba, e))?;
        let ident = instance.datadir.join("pg_ident.conf");
        tokio::fs::write(&ident, "# MAPNAME       SYSTEM-USERNAME         PG-USERNAME\n")
            .await
            .map_err(|e| ControlError::io(&ident, e))?;
        debug!(instance = %instance, "authentication configured");
        Ok(Some(true))
    }

    async fn start_postgresql(
        &self,
        instance: &Instance,
        options: &StartOptions,
    ) -> ControlResult<Option<bool>> {
        info!(instance = %instance, "starting PostgreSQL");
        self.pg_ctl_start(instance, options).await?;
        if options.wait {
            self.wait_ready(instance).await?;
        }
        Ok(Some(true))
    }

    async fn stop_postgresql(
        &self,
        instance: &Instance,
        options: &StopOptions,
    ) -> ControlResult<Option<bool>> {
        if self.status(instance).await? != RunStatus::Running {
            debug!(instance = %instance, "already stopped");
            return Ok(Some(true));
        }
        info!(instance = %instance, mode = %options.mode, "stopping PostgreSQL");
        let spec = Self::pg_ctl(instance, "stop")
            .arg("-m")
            .arg(options.mode.to_string())
            .arg(if options.wait { "--wait" } else { "--no-wait" });
        self.runner.run(&spec).await?;
        Ok(Some(true))
    }

    async fn restart_postgresql(
        &self,
        instance: &Instance,
        mode: StopMode,
        wait: bool,
    ) -> ControlResult<Option<bool>> {
        self.stop_postgresql(instance, &StopOptions { mode, wait: true })
            .await?;
        let options = StartOptions {
            wait,
            ..StartOptions::default()
        };
        self.start_postgresql(instance, &options).await
    }

    async fn reload_postgresql(&self, instance: &Instance) -> ControlResult<Option<bool>> {
        info!(instance = %instance, "reloading PostgreSQL configuration");
        db::with_connection(instance, &self.config, None, |conn| {
            async move {
                sqlx::query("SELECT pg_reload_conf()")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
            .boxed()
        })
        .await?;
        Ok(Some(true))
    }

    async fn promote_postgresql(&self, instance: &Instance) -> ControlResult<Option<bool>> {
        info!(instance = %instance, "promoting PostgreSQL");
        self.runner
            .run(&Self::pg_ctl(instance, "promote").arg("--wait"))
            .await?;
        Ok(Some(true))
    }

    async fn instance_status(&self, instance: &Instance) -> ControlResult<Option<ServiceStatus>> {
        let status = self.status(instance).await?;
        let mut report = ServiceStatus::new(SERVICE_NAME, status);
        if status == RunStatus::Unknown {
            report = report.with_detail("pg_ctl could not read the data directory");
        }
        Ok(Some(report))
    }

    async fn instance_dropped(&self, instance: &Instance) -> ControlResult<Option<()>> {
        if let Some(logfile) = self.start_logfile(instance) {
            match tokio::fs::remove_file(&logfile).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ControlError::io(&logfile, e)),
            }
        }
        Ok(Some(()))
    }
}

/// One `pg_isready` probe against the instance socket
pub(crate) async fn pg_isready(
    runner: &dyn ProcessRunner,
    instance: &Instance,
    user: &str,
) -> ProbeOutcome<()> {
    let spec = CommandSpec::new([
        instance.bin("pg_isready"),
        "-h".to_string(),
        path_arg(&instance.socket_directory),
        "-p".to_string(),
        instance.port.to_string(),
        "-U".to_string(),
        user.to_string(),
        "-d".to_string(),
        "postgres".to_string(),
    ])
    .check(false);
    match runner.run(&spec).await {
        Ok(output) => match output.returncode {
            0 => ProbeOutcome::Ready(()),
            1 => ProbeOutcome::NotReadyYet("server is rejecting connections".to_string()),
            2 => ProbeOutcome::NotReadyYet("no response from server".to_string()),
            code => ProbeOutcome::Fatal(ControlError::Command {
                code,
                argv: spec.argv.clone(),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        },
        Err(e) => ProbeOutcome::Fatal(e),
    }
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Create a file readable by its owner only
pub(crate) async fn write_private(path: &Path, content: &str) -> ControlResult<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .map_err(|e| ControlError::io(path, e))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| ControlError::io(path, e))?;
    file.flush().await.map_err(|e| ControlError::io(path, e))?;
    Ok(())
}
