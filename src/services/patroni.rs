//! # HA Coordinator Service
//!
//! Runs a Patroni daemon per instance. When enabled for an instance (its YAML
//! configuration file exists), Patroni owns the PostgreSQL lifecycle: it
//! bootstraps the data directory, starts and stops the server, and answers
//! restart and reload requests over its REST API.
//!
//! ## Readiness
//!
//! Bootstrap is complete once (1) the data directory exists, (2) the server
//! accepts connections and (3) the REST API `readiness` endpoint answers 200.
//! Refused connections while bootstrapping mean "not ready yet"; in steady
//! state they mean the coordinator is unreachable.

use super::postgresql::{path_arg, pg_isready, write_private};
use super::remove_if_exists;
use crate::config::{ConfigurationError, ControlConfig, PatroniConfig};
use crate::error::{ControlError, ControlResult};
use crate::models::{
    Instance, InstanceManifest, PatroniOptions, RunStatus, ServiceStatus, StartOptions,
    StopMode, StopOptions,
};
use crate::orchestration::log_follow::LogFollower;
use crate::orchestration::process::{CommandSpec, ProcessRunner};
use crate::orchestration::retry::{poll_until_ready, ProbeOutcome, RetryPolicy};
use crate::pgconf::{diff, ConfigChanges, SettingValue, Settings};
use crate::registry::{HookName, SatelliteService};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

pub const SERVICE_NAME: &str = "patroni";

const HOOKS: &[HookName] = &[
    HookName::InitPostgresql,
    HookName::ConfigurePostgresql,
    HookName::StartPostgresql,
    HookName::StopPostgresql,
    HookName::RestartPostgresql,
    HookName::ReloadPostgresql,
    HookName::CoordinatorManaged,
    HookName::InstanceStatus,
    HookName::InstanceDropped,
];

/// Patroni YAML configuration, limited to the sections we manage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatroniYaml {
    pub scope: String,
    pub name: String,
    pub restapi: RestApiSection,
    pub etcd3: EtcdSection,
    pub loop_wait: u32,
    pub bootstrap: BootstrapSection,
    pub postgresql: PostgresqlSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestApiSection {
    pub listen: String,
    pub connect_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cafile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtcdSection {
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSection {
    pub dcs: DcsSection,
    pub initdb: Vec<InitdbOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcsSection {
    pub loop_wait: u32,
}

/// `initdb` entries are either bare flags or single-key mappings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitdbOption {
    Flag(String),
    Value(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresqlSection {
    pub listen: String,
    pub connect_address: String,
    pub data_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub authentication: Authentication,
    #[serde(default)]
    pub parameters: Settings,
    #[serde(default)]
    pub pg_hba: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    pub superuser: Credentials,
    pub replication: Credentials,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterMember {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterState {
    #[serde(default)]
    members: Vec<ClusterMember>,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeStatus {
    state: String,
    #[serde(default)]
    role: Option<String>,
}

impl PostgresqlSection {
    /// Parameters plus the port taken from `listen`, for change detection
    fn effective_parameters(&self) -> Settings {
        let mut settings = self.parameters.clone();
        if let Some(port) = address_port(&self.listen) {
            settings.insert("port".to_string(), SettingValue::Int(i64::from(port)));
        }
        settings
    }
}

/// Changes to PostgreSQL parameters between two `postgresql` sections
pub fn postgresql_changes(
    before: Option<&PostgresqlSection>,
    after: &PostgresqlSection,
) -> ConfigChanges {
    let before = before
        .map(PostgresqlSection::effective_parameters)
        .unwrap_or_default();
    diff(&before, &after.effective_parameters())
}

fn address_port(address: &str) -> Option<u16> {
    address.rsplit_once(':')?.1.parse().ok()
}

fn address_host(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}

pub struct PatroniService {
    config: Arc<ControlConfig>,
    settings: PatroniConfig,
    runner: Arc<dyn ProcessRunner>,
    client: reqwest::Client,
    scheme: &'static str,
}

impl PatroniService {
    /// Build the service and its REST client; TLS material is read once here
    pub async fn new(
        config: Arc<ControlConfig>,
        settings: PatroniConfig,
        runner: Arc<dyn ProcessRunner>,
    ) -> ControlResult<Self> {
        let restapi = &settings.restapi;
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_millis(restapi.timeout_ms));
        let mut scheme = "http";
        if let Some(cafile) = &restapi.cafile {
            let pem = tokio::fs::read(cafile)
                .await
                .map_err(|e| ControlError::io(cafile, e))?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ConfigurationError::invalid_value("patroni.restapi.cafile", cafile.display().to_string(), e.to_string())
            })?;
            builder = builder.add_root_certificate(certificate);
            scheme = "https";
        }
        if let (Some(certfile), Some(keyfile)) = (&restapi.certfile, &restapi.keyfile) {
            let mut pem = tokio::fs::read(certfile)
                .await
                .map_err(|e| ControlError::io(certfile, e))?;
            pem.extend(
                tokio::fs::read(keyfile)
                    .await
                    .map_err(|e| ControlError::io(keyfile, e))?,
            );
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                ConfigurationError::invalid_value("patroni.restapi.certfile", certfile.display().to_string(), e.to_string())
            })?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| ConfigurationError::load_error("patroni REST client", e))?;

        Ok(Self {
            config,
            settings,
            runner,
            client,
            scheme,
        })
    }

    pub fn configpath(&self, instance: &Instance) -> PathBuf {
        self.settings
            .configdir
            .join(format!("{}.yaml", instance.qualname()))
    }

    pub fn logfile(&self, instance: &Instance) -> PathBuf {
        self.settings
            .logdir
            .join(instance.qualname())
            .join("patroni.log")
    }

    fn pidfile(&self, instance: &Instance) -> PathBuf {
        self.config
            .paths
            .run_root
            .join(format!("patroni-{}.pid", instance.qualname()))
    }

    /// Whether the coordinator manages this instance
    pub async fn enabled(&self, instance: &Instance) -> bool {
        tokio::fs::try_exists(self.configpath(instance))
            .await
            .unwrap_or(false)
    }

    /// Configuration for a new member, bootstrapped with the manifest's settings
    pub fn build_config(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
        options: &PatroniOptions,
    ) -> PatroniYaml {
        let pg = &self.config.postgresql;
        let listen = options
            .restapi_listen
            .clone()
            .unwrap_or_else(|| self.settings.restapi.listen.clone());

        let mut initdb = Vec::new();
        if let Some(locale) = manifest.locale.as_ref().or(pg.initdb.locale.as_ref()) {
            initdb.push(InitdbOption::Value(BTreeMap::from([(
                "locale".to_string(),
                locale.clone(),
            )])));
        }
        if let Some(encoding) = manifest.encoding.as_ref().or(pg.initdb.encoding.as_ref()) {
            initdb.push(InitdbOption::Value(BTreeMap::from([(
                "encoding".to_string(),
                encoding.clone(),
            )])));
        }
        if manifest.data_checksums.unwrap_or(pg.initdb.data_checksums) {
            initdb.push(InitdbOption::Flag("data-checksums".to_string()));
        }
        initdb.push(InitdbOption::Value(BTreeMap::from([(
            "waldir".to_string(),
            path_arg(&instance.waldir),
        )])));

        let mut parameters = manifest.settings.clone();
        parameters.remove("port");

        let local = manifest.auth.local.as_deref().unwrap_or(&pg.auth.local);
        let host = manifest.auth.host.as_deref().unwrap_or(&pg.auth.host);

        PatroniYaml {
            scope: options.cluster.clone(),
            name: options
                .node
                .clone()
                .unwrap_or_else(|| instance.name().to_string()),
            restapi: RestApiSection {
                connect_address: listen.clone(),
                listen,
                cafile: self.settings.restapi.cafile.clone(),
                certfile: self.settings.restapi.certfile.clone(),
                keyfile: self.settings.restapi.keyfile.clone(),
            },
            etcd3: EtcdSection {
                hosts: self.settings.etcd_hosts.clone(),
            },
            loop_wait: self.settings.loop_wait,
            bootstrap: BootstrapSection {
                dcs: DcsSection {
                    loop_wait: self.settings.loop_wait,
                },
                initdb,
            },
            postgresql: PostgresqlSection {
                listen: format!("*:{}", instance.port),
                connect_address: format!("127.0.0.1:{}", instance.port),
                data_dir: instance.datadir.clone(),
                bin_dir: instance.bindir.clone(),
                authentication: Authentication {
                    superuser: Credentials {
                        username: pg.surole.name.clone(),
                        password: manifest
                            .surole_password
                            .clone()
                            .or_else(|| pg.surole.password.clone()),
                    },
                    replication: Credentials {
                        username: pg.replrole.clone(),
                        password: None,
                    },
                },
                parameters,
                pg_hba: vec![
                    format!("local all all {local}"),
                    format!("host all all 127.0.0.1/32 {host}"),
                    format!("host all all ::1/128 {host}"),
                    format!("local replication all {local}"),
                    format!("host replication {} 0.0.0.0/0 {host}", pg.replrole),
                ],
            },
        }
    }

    pub async fn load_config(&self, instance: &Instance) -> ControlResult<PatroniYaml> {
        let path = self.configpath(instance);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ControlError::io(&path, e))?;
        serde_yaml::from_str(&content).map_err(|e| {
            ConfigurationError::file_read_error(path.display().to_string(), e).into()
        })
    }

    async fn write_config(&self, instance: &Instance, config: &PatroniYaml) -> ControlResult<()> {
        let path = self.configpath(instance);
        let content = serde_yaml::to_string(config)
            .map_err(|e| ControlError::system(format!("failed to render {}: {e}", path.display())))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControlError::io(parent, e))?;
        }
        write_private(&path, &content).await?;
        debug!(instance = %instance, path = %path.display(), "Patroni configuration written");
        Ok(())
    }

    /// Start the daemon in the background and record its pid
    async fn spawn(&self, instance: &Instance) -> ControlResult<u32> {
        let logfile = self.logfile(instance);
        if let Some(logdir) = logfile.parent() {
            tokio::fs::create_dir_all(logdir)
                .await
                .map_err(|e| ControlError::io(logdir, e))?;
        }
        let spec = CommandSpec::new([
            path_arg(&self.settings.execpath),
            path_arg(&self.configpath(instance)),
        ]);
        info!(instance = %instance, "starting Patroni");
        let pid = self.runner.spawn_detached(&spec, Some(logfile.as_path())).await?;
        if let Err(e) = self.record_pid(instance, pid).await {
            self.kill(instance, pid).await;
            return Err(e);
        }
        Ok(pid)
    }

    async fn record_pid(&self, instance: &Instance, pid: u32) -> ControlResult<()> {
        let pidfile = self.pidfile(instance);
        if let Some(parent) = pidfile.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControlError::io(parent, e))?;
        }
        tokio::fs::write(&pidfile, format!("{pid}\n"))
            .await
            .map_err(|e| ControlError::io(&pidfile, e))
    }

    /// Send SIGTERM; a process that is already gone is not an error
    async fn kill(&self, instance: &Instance, pid: u32) {
        info!(instance = %instance, pid, "stopping Patroni");
        let spec = CommandSpec::new(["kill".to_string(), "-TERM".to_string(), pid.to_string()]).check(false);
        match self.runner.run(&spec).await {
            Ok(output) if !output.success() => debug!(pid, "Patroni process already gone"),
            Ok(_) => {}
            Err(e) => warn!(instance = %instance, pid, error = %e, "failed to signal Patroni"),
        }
    }

    async fn read_pid(&self, instance: &Instance) -> Option<u32> {
        tokio::fs::read_to_string(self.pidfile(instance))
            .await
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    fn url(&self, listen: &str, path: &str) -> String {
        format!("{}://{}/{}", self.scheme, listen, path.trim_start_matches('/'))
    }

    /// Whether something accepts TCP connections on the REST API address
    async fn api_listening(listen: &str) -> bool {
        let connect = tokio::net::TcpStream::connect((address_host(listen), address_port(listen).unwrap_or(8008)));
        matches!(
            tokio::time::timeout(Duration::from_secs(1), connect).await,
            Ok(Ok(_))
        )
    }

    /// REST API request; a refused connection is reported as unreachable
    async fn api_request(
        &self,
        instance: &Instance,
        listen: &str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ControlResult<reqwest::Response> {
        let mut request = self.client.request(method.clone(), self.url(listen, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                error!(instance = %instance, listen, error = %e, "failed to connect to Patroni REST API");
                return Err(ControlError::Unreachable(format!(
                    "REST API server for {instance} at {listen}"
                )));
            }
            Err(e) => {
                return Err(ControlError::system(format!(
                    "{method} {path} on {listen} failed: {e}"
                )))
            }
        };
        if !response.status().is_success() {
            return Err(ControlError::system(format!(
                "{method} {path} on {listen} returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// One bootstrap readiness probe
    async fn probe_bootstrap(&self, instance: &Instance, listen: &str, pid: Option<u32>) -> ProbeOutcome<()> {
        if let Some(pid) = pid {
            if !process_alive(pid) {
                return ProbeOutcome::Fatal(ControlError::system(format!(
                    "Patroni for {instance} exited during bootstrap, see {}",
                    self.logfile(instance).display()
                )));
            }
        }
        if !Instance::is_initialized(&instance.datadir).await {
            return ProbeOutcome::NotReadyYet("PostgreSQL instance not created yet".to_string());
        }
        match pg_isready(self.runner.as_ref(), instance, &self.config.postgresql.surole.name).await {
            ProbeOutcome::Ready(()) => {}
            other => return other,
        }
        match self.client.get(self.url(listen, "readiness")).send().await {
            Ok(response) if response.status() == StatusCode::OK => ProbeOutcome::Ready(()),
            Ok(response) => ProbeOutcome::NotReadyYet(format!("readiness returned {}", response.status())),
            Err(e) if e.is_connect() => ProbeOutcome::NotReadyYet("REST API not listening".to_string()),
            Err(e) => ProbeOutcome::NotReadyYet(format!("readiness check failed: {e}")),
        }
    }

    /// Wait for bootstrap to complete, forwarding Patroni's log while waiting.
    /// PostgreSQL's own log is followed as well once the server reports it.
    async fn wait_ready(&self, instance: &Instance, listen: &str, pid: Option<u32>) -> ControlResult<()> {
        let logfile = self.logfile(instance);
        let logfile_policy = RetryPolicy::from(&self.config.retry.logfile_wait);
        poll_until_ready("waiting for Patroni log file", &logfile_policy, || async {
            if tokio::fs::try_exists(&logfile).await.unwrap_or(false) {
                ProbeOutcome::Ready(())
            } else {
                ProbeOutcome::NotReadyYet(format!("{} not found yet", logfile.display()))
            }
        })
        .await?;

        let follower = LogFollower::start_at(&logfile, SERVICE_NAME, 0);
        let postgresql_follower = parking_lot::Mutex::new(None::<LogFollower>);
        let policy = RetryPolicy::from(&self.config.retry.coordinator_ready);
        let this = self;
        let pg_follower = &postgresql_follower;
        let result = poll_until_ready(
            &format!("waiting for Patroni to bootstrap {instance}"),
            &policy,
            move || async move {
                if pg_follower.lock().is_none() {
                    if let Some(path) = current_logfile(&instance.datadir).await {
                        debug!(instance = %instance, path = %path.display(), "following PostgreSQL log");
                        *pg_follower.lock() = Some(LogFollower::start_at(path, "postgresql", 0));
                    }
                }
                this.probe_bootstrap(instance, listen, pid).await
            },
        )
        .await;

        let followers = std::iter::once(follower).chain(postgresql_follower.into_inner());
        for follower in followers {
            if let Err(e) = follower.stop().await {
                warn!(error = %e, "log follower failed");
            }
        }
        result
    }

    async fn wait_api_down(&self, listen: &str) -> ControlResult<()> {
        let policy = RetryPolicy::from(&self.config.retry.coordinator_down);
        poll_until_ready("waiting for Patroni REST API to stop", &policy, || async {
            if Self::api_listening(listen).await {
                ProbeOutcome::NotReadyYet("Patroni REST API still running".to_string())
            } else {
                ProbeOutcome::Ready(())
            }
        })
        .await
    }

    /// Stop the daemon recorded in the pidfile, whether or not its REST API is up
    async fn terminate(&self, instance: &Instance, listen: &str) -> ControlResult<()> {
        if let Some(pid) = self.read_pid(instance).await {
            self.kill(instance, pid).await;
        }
        self.wait_api_down(listen).await?;
        remove_if_exists(&self.pidfile(instance)).await?;
        Ok(())
    }

    /// Stop a daemon that failed to bootstrap and remove every file it was given
    async fn abort_bootstrap(&self, instance: &Instance, listen: &str) {
        warn!(instance = %instance, "Patroni bootstrap failed, cleaning up");
        if let Err(e) = self.terminate(instance, listen).await {
            warn!(instance = %instance, error = %e, "failed to stop Patroni");
        }
        for path in [
            self.configpath(instance),
            self.logfile(instance),
            self.pidfile(instance),
        ] {
            if let Err(e) = remove_if_exists(&path).await {
                warn!(instance = %instance, error = %e, "failed to remove Patroni file");
            }
        }
    }

    /// Keep a copy of the configuration when this node is the last cluster member
    async fn maybe_backup_config(&self, instance: &Instance, config: &PatroniYaml) -> ControlResult<()> {
        let listen = &config.restapi.listen;
        let members = match self.api_request(instance, listen, Method::GET, "cluster", None).await {
            Ok(response) => match response.json::<ClusterState>().await {
                Ok(state) => state.members,
                Err(e) => {
                    error!(instance = %instance, error = %e, "invalid cluster state");
                    return Ok(());
                }
            },
            Err(e) => {
                error!(instance = %instance, error = %e, "failed to retrieve cluster members");
                return Ok(());
            }
        };
        if members.len() != 1 || members[0].name != config.name {
            return Ok(());
        }

        let configpath = self.configpath(instance);
        let backupdir = self
            .settings
            .backupdir
            .clone()
            .or_else(|| configpath.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| self.settings.configdir.clone());
        let backuppath = backupdir.join(format!(
            "{}-{}-{}.yaml",
            config.scope,
            config.name,
            chrono::Utc::now().timestamp()
        ));
        warn!(
            node = %config.name,
            cluster = %config.scope,
            path = %backuppath.display(),
            "last member of the cluster, saving Patroni configuration"
        );
        let original = tokio::fs::read_to_string(&configpath)
            .await
            .map_err(|e| ControlError::io(&configpath, e))?;
        write_private(
            &backuppath,
            &format!(
                "# Backup of Patroni configuration for instance '{}'\n{original}",
                instance.qualname()
            ),
        )
        .await
    }
}

/// Log file PostgreSQL is writing to, from `current_logfiles` in the data directory
async fn current_logfile(datadir: &Path) -> Option<PathBuf> {
    let content = tokio::fs::read_to_string(datadir.join("current_logfiles"))
        .await
        .ok()?;
    let (_, path) = content.lines().next()?.trim().split_once(' ')?;
    let path = Path::new(path.trim());
    Some(if path.is_relative() {
        datadir.join(path)
    } else {
        path.to_path_buf()
    })
}

fn process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(pid).is_some()
}

#[async_trait]
impl SatelliteService for PatroniService {
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
        let Some(options) = &manifest.patroni else {
            return Ok(None);
        };
        let config = self.build_config(manifest, instance, options);
        let listen = &config.restapi.listen;
        let bootstrapped = async {
            self.write_config(instance, &config).await?;
            let pid = self.spawn(instance).await?;
            self.wait_ready(instance, listen, Some(pid)).await
        }
        .await;
        if let Err(e) = bootstrapped {
            self.abort_bootstrap(instance, listen).await;
            return Err(e);
        }
        info!(instance = %instance, "instance successfully created by Patroni");
        Ok(Some(true))
    }

    async fn configure_postgresql(
        &self,
        configuration: &Settings,
        _manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<Option<ConfigChanges>> {
        if !self.enabled(instance).await {
            return Ok(None);
        }
        let mut config = self.load_config(instance).await?;
        let before = config.postgresql.clone();

        let mut parameters = configuration.clone();
        let port = match parameters.remove("port") {
            Some(SettingValue::Int(port)) => u16::try_from(port).unwrap_or(instance.port),
            _ => instance.port,
        };
        config.postgresql.parameters = parameters;
        config.postgresql.listen = format!("{}:{port}", address_host(&before.listen));
        config.postgresql.connect_address =
            format!("{}:{port}", address_host(&before.connect_address));

        let changes = postgresql_changes(Some(&before), &config.postgresql);
        if !changes.is_empty() {
            self.write_config(instance, &config).await?;
        }
        Ok(Some(changes))
    }

    async fn start_postgresql(
        &self,
        instance: &Instance,
        options: &StartOptions,
    ) -> ControlResult<Option<bool>> {
        if !self.enabled(instance).await {
            return Ok(None);
        }
        let config = self.load_config(instance).await?;
        if Self::api_listening(&config.restapi.listen).await {
            debug!(instance = %instance, "Patroni already running");
            return Ok(Some(true));
        }
        let pid = self.spawn(instance).await?;
        if options.wait {
            self.wait_ready(instance, &config.restapi.listen, Some(pid))
                .await?;
        }
        Ok(Some(true))
    }

    async fn stop_postgresql(
        &self,
        instance: &Instance,
        _options: &StopOptions,
    ) -> ControlResult<Option<bool>> {
        if !self.enabled(instance).await {
            return Ok(None);
        }
        let config = self.load_config(instance).await?;
        self.terminate(instance, &config.restapi.listen).await?;
        Ok(Some(true))
    }

    async fn restart_postgresql(
        &self,
        instance: &Instance,
        _mode: StopMode,
        _wait: bool,
    ) -> ControlResult<Option<bool>> {
        if !self.enabled(instance).await {
            return Ok(None);
        }
        let config = self.load_config(instance).await?;
        info!(instance = %instance, "restarting through Patroni");
        self.api_request(
            instance,
            &config.restapi.listen,
            Method::POST,
            "restart",
            Some(serde_json::json!({ "timeout": 3 })),
        )
        .await?;
        Ok(Some(true))
    }

    async fn reload_postgresql(&self, instance: &Instance) -> ControlResult<Option<bool>> {
        if !self.enabled(instance).await {
            return Ok(None);
        }
        let config = self.load_config(instance).await?;
        info!(instance = %instance, "reloading through Patroni");
        self.api_request(instance, &config.restapi.listen, Method::POST, "reload", None)
            .await?;
        Ok(Some(true))
    }

    async fn coordinator_managed(&self, instance: &Instance) -> ControlResult<Option<bool>> {
        Ok(Some(self.enabled(instance).await))
    }

    async fn instance_status(&self, instance: &Instance) -> ControlResult<Option<ServiceStatus>> {
        if !self.enabled(instance).await {
            return Ok(None);
        }
        let config = self.load_config(instance).await?;
        let status = match self
            .api_request(instance, &config.restapi.listen, Method::GET, "patroni", None)
            .await
        {
            Ok(response) => match response.json::<NodeStatus>().await {
                Ok(node) => {
                    let status = if node.state == "running" {
                        RunStatus::Running
                    } else {
                        RunStatus::NotRunning
                    };
                    ServiceStatus::new(SERVICE_NAME, status).with_detail(format!(
                        "{} ({})",
                        node.state,
                        node.role.unwrap_or_else(|| "unknown role".to_string())
                    ))
                }
                Err(e) => ServiceStatus::new(SERVICE_NAME, RunStatus::Unknown)
                    .with_detail(format!("invalid status response: {e}")),
            },
            Err(e) if e.is_unreachable() => {
                ServiceStatus::new(SERVICE_NAME, RunStatus::NotRunning).with_detail(e.to_string())
            }
            Err(e) => return Err(e),
        };
        Ok(Some(status))
    }

    async fn instance_dropped(&self, instance: &Instance) -> ControlResult<Option<()>> {
        if !self.enabled(instance).await {
            return Ok(None);
        }
        let config = self.load_config(instance).await?;
        let listen = config.restapi.listen.clone();
        if Self::api_listening(&listen).await {
            self.maybe_backup_config(instance, &config).await?;
        }
        self.terminate(instance, &listen).await?;
        info!(instance = %instance, "deconfiguring Patroni service");
        remove_if_exists(&self.configpath(instance)).await?;
        remove_if_exists(&self.logfile(instance)).await?;
        remove_if_exists(&self.pidfile(instance)).await?;
        Ok(Some(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicyConfig;
    use crate::orchestration::process::{CommandOutput, SystemProcessRunner};
    use tempfile::TempDir;

    /// Pretends to start the daemon, which then never writes its log
    #[derive(Default)]
    struct SilentDaemonRunner {
        calls: parking_lot::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ProcessRunner for SilentDaemonRunner {
        async fn run(&self, spec: &CommandSpec) -> ControlResult<CommandOutput> {
            self.calls.lock().push(spec.argv.clone());
            Ok(CommandOutput::default())
        }

        async fn spawn_detached(&self, spec: &CommandSpec, _log_file: Option<&Path>) -> ControlResult<u32> {
            self.calls.lock().push(spec.argv.clone());
            Ok(4242)
        }
    }

    async fn service(dir: &Path) -> PatroniService {
        service_with(dir, Arc::new(SystemProcessRunner)).await
    }

    async fn service_with(dir: &Path, runner: Arc<dyn ProcessRunner>) -> PatroniService {
        let mut config = ControlConfig::default();
        config.paths.data_root = dir.join("data");
        config.paths.run_root = dir.join("run");
        config.retry.logfile_wait = RetryPolicyConfig {
            min_interval_ms: 1,
            max_interval_ms: 1,
            multiplier: 1.0,
            max_attempts: Some(2),
            deadline_ms: None,
        };
        let settings = PatroniConfig {
            configdir: dir.join("patroni"),
            logdir: dir.join("log"),
            ..PatroniConfig::default()
        };
        PatroniService::new(Arc::new(config), settings, runner)
            .await
            .unwrap()
    }

    fn manifest() -> InstanceManifest {
        let mut manifest = InstanceManifest::new("main")
            .with_port(5444)
            .with_setting("work_mem", "8MB")
            .with_setting("port", 5444);
        manifest.patroni = Some(PatroniOptions {
            cluster: "pgcluster".to_string(),
            node: None,
            restapi_listen: Some("127.0.0.1:8010".to_string()),
        });
        manifest
    }

    #[tokio::test]
    async fn test_build_config() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        let manifest = manifest();
        let instance = Instance::from_manifest(&manifest, &service.config);
        let config = service.build_config(&manifest, &instance, manifest.patroni.as_ref().unwrap());

        assert_eq!(config.scope, "pgcluster");
        assert_eq!(config.name, "main");
        assert_eq!(config.restapi.listen, "127.0.0.1:8010");
        assert_eq!(config.postgresql.listen, "*:5444");
        assert!(!config.postgresql.parameters.contains_key("port"));
        assert_eq!(
            config.postgresql.parameters["work_mem"],
            SettingValue::from("8MB")
        );
    }

    #[tokio::test]
    async fn test_config_written_and_enabled() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        let manifest = manifest();
        let instance = Instance::from_manifest(&manifest, &service.config);
        assert!(!service.enabled(&instance).await);

        let config = service.build_config(&manifest, &instance, manifest.patroni.as_ref().unwrap());
        service.write_config(&instance, &config).await.unwrap();
        assert!(service.enabled(&instance).await);
        assert_eq!(service.load_config(&instance).await.unwrap(), config);
        assert!(service
            .coordinator_managed(&instance)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_configure_reports_parameter_and_port_changes() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        let manifest = manifest();
        let instance = Instance::from_manifest(&manifest, &service.config);
        let config = service.build_config(&manifest, &instance, manifest.patroni.as_ref().unwrap());
        service.write_config(&instance, &config).await.unwrap();

        let mut desired = Settings::new();
        desired.insert("work_mem".into(), "16MB".into());
        desired.insert("port".into(), SettingValue::Int(5445));
        let changes = service
            .configure_postgresql(&desired, &manifest, &instance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["port", "work_mem"]);

        let reloaded = service.load_config(&instance).await.unwrap();
        assert_eq!(reloaded.postgresql.listen, "*:5445");

        let again = service
            .configure_postgresql(&desired, &manifest, &instance)
            .await
            .unwrap()
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_instance_is_not_claimed() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        let instance = Instance::from_manifest(&InstanceManifest::new("plain"), &service.config);
        assert!(service
            .start_postgresql(&instance, &StartOptions::default())
            .await
            .unwrap()
            .is_none());
        assert!(service.instance_dropped(&instance).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_bootstrap_stops_daemon_and_removes_files() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(SilentDaemonRunner::default());
        let service = service_with(dir.path(), runner.clone()).await;
        let manifest = manifest();
        let instance = Instance::from_manifest(&manifest, &service.config);

        let err = service
            .init_postgresql(&manifest, &instance)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Timeout { .. }));

        let calls = runner.calls.lock().clone();
        assert!(calls.contains(&vec![
            "kill".to_string(),
            "-TERM".to_string(),
            "4242".to_string()
        ]));
        assert!(!service.configpath(&instance).exists());
        assert!(!service.pidfile(&instance).exists());
        assert!(!service.enabled(&instance).await);
    }

    #[tokio::test]
    async fn test_drop_stops_daemon_without_rest_api() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(SilentDaemonRunner::default());
        let service = service_with(dir.path(), runner.clone()).await;
        let manifest = manifest();
        let instance = Instance::from_manifest(&manifest, &service.config);
        let config = service.build_config(&manifest, &instance, manifest.patroni.as_ref().unwrap());
        service.write_config(&instance, &config).await.unwrap();
        service.record_pid(&instance, 4243).await.unwrap();

        assert!(service.instance_dropped(&instance).await.unwrap().is_some());
        assert!(runner
            .calls
            .lock()
            .iter()
            .any(|argv| argv.last().map(String::as_str) == Some("4243")));
        assert!(!service.pidfile(&instance).exists());
        assert!(!service.configpath(&instance).exists());
    }

    #[tokio::test]
    async fn test_current_logfile_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        assert!(current_logfile(dir.path()).await.is_none());

        tokio::fs::write(
            dir.path().join("current_logfiles"),
            "stderr log/postgresql-Mon.log\n",
        )
        .await
        .unwrap();
        assert_eq!(
            current_logfile(dir.path()).await,
            Some(dir.path().join("log/postgresql-Mon.log"))
        );
    }

    #[test]
    fn test_address_parts() {
        assert_eq!(address_port("127.0.0.1:8008"), Some(8008));
        assert_eq!(address_host("127.0.0.1:8008"), "127.0.0.1");
        assert_eq!(address_port("nohost"), None);
    }
}
