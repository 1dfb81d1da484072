//! # Instance Orchestrator
//!
//! Reconciles instance manifests against the host. Every public operation
//! takes the instance's exclusive lock, runs inside a span carrying a fresh
//! `operation_id`, and reports failures with the instance identity and the
//! operation that was attempted.
//!
//! ## Lifecycle
//!
//! Creation is a revertible pipeline:
//!
//! 1. allocate data and WAL directories (revert: remove them)
//! 2. `InitPostgresql`, claimed by exactly one service (revert: teardown hooks)
//! 3. configuration: site settings, service contributions and manifest
//!    settings are merged and written by the `ConfigurePostgresql` owner
//! 4. `ConfigureAuth`
//! 5. start, when the manifest asks for a running instance (revert: stop)
//!
//! Start, stop, restart, reload and promote dispatch first-non-null so one
//! control path acts. The built-in PostgreSQL service is registered run-last
//! and answers when no coordinator claims the instance.
//!
//! The filesystem is the source of truth. State machines are kept in memory
//! for history and guards, and are re-synchronized with the host at the start
//! of every operation.

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult, ErrorKind};
use crate::logging::{log_error, log_instance_operation};
use crate::models::{
    ChangeState, DesiredState, Instance, InstanceInfo, InstanceKey, InstanceManifest, RunStatus,
    ServiceStatus, StartOptions, StopMode, StopOptions,
};
use crate::orchestration::task::{Pipeline, Task};
use crate::pgconf::{
    merge, resolve_memory_percentages, restart_required, ConfigChanges, HostMemory, SettingValue,
    Settings, SystemMemory,
};
use crate::registry::{HookName, HookRegistry};
use crate::state_machine::{
    InstanceEvent, InstanceState, InstanceStateMachine, Role, TransitionRecord,
};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What `apply` did to an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyResult {
    /// `None` when the instance already matched its manifest
    pub change_state: Option<ChangeState>,
    pub changes: ConfigChanges,
    /// Changed settings that only take effect after a restart
    pub pending_restart: Vec<String>,
    pub drop_report: Option<DropReport>,
}

/// A teardown hook that failed while dropping an instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeardownFailure {
    pub service: String,
    pub kind: ErrorKind,
    pub error: String,
}

/// Outcome of the teardown hooks run by `drop`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DropReport {
    pub instance: InstanceKey,
    /// Services that removed something
    pub cleaned: Vec<String>,
    pub failures: Vec<TeardownFailure>,
}

impl DropReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Orchestrator {
    config: Arc<ControlConfig>,
    registry: Arc<HookRegistry>,
    memory: Arc<dyn HostMemory>,
    states: parking_lot::Mutex<HashMap<InstanceKey, InstanceStateMachine>>,
    locks: DashMap<InstanceKey, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(config: Arc<ControlConfig>, registry: Arc<HookRegistry>) -> Self {
        Self {
            config,
            registry,
            memory: Arc::new(SystemMemory),
            states: parking_lot::Mutex::new(HashMap::new()),
            locks: DashMap::new(),
        }
    }

    /// Use another source of host memory for percentage settings
    pub fn with_memory(mut self, memory: Arc<dyn HostMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Bring an instance to the state its manifest describes
    pub async fn apply(&self, manifest: &InstanceManifest) -> ControlResult<ApplyResult> {
        let key = InstanceKey::from_manifest(manifest, &self.config);
        self.operation(&key, "apply", |operation_id| async move {
            let desired = Instance::from_manifest(manifest, &self.config);
            let exists = Instance::is_initialized(&desired.datadir).await;

            if manifest.state == DesiredState::Absent {
                if !exists {
                    debug!(instance = %desired, "instance already absent");
                    return Ok(ApplyResult::default());
                }
                let (instance, mut machine) = self.load(&desired.key).await?;
                let report = self.drop_inner(&instance, &mut machine).await?;
                self.store(machine);
                return Ok(ApplyResult {
                    change_state: Some(ChangeState::Dropped),
                    drop_report: Some(report),
                    ..ApplyResult::default()
                });
            }

            if !exists {
                let changes = self.create_inner(manifest, operation_id).await?;
                return Ok(ApplyResult {
                    change_state: Some(ChangeState::Created),
                    changes,
                    ..ApplyResult::default()
                });
            }

            let (instance, mut machine) = self.load(&desired.key).await?;
            let before = machine.current_state();
            let (changes, pending_restart) =
                self.reconfigure(manifest, &instance, &mut machine).await?;

            let running = machine.current_state() == InstanceState::Running;
            match manifest.state {
                DesiredState::Started if !running => {
                    self.start_inner(&instance, &mut machine, &StartOptions::default())
                        .await?
                }
                DesiredState::Stopped if running => {
                    self.stop_inner(&instance, &mut machine, &StopOptions::default())
                        .await?
                }
                _ => {}
            }

            let changed = !changes.is_empty() || machine.current_state() != before;
            self.store(machine);
            Ok(ApplyResult {
                change_state: changed.then_some(ChangeState::Changed),
                changes,
                pending_restart,
                drop_report: None,
            })
        })
        .await
    }

    /// Create a new instance; it must not exist yet
    pub async fn create(&self, manifest: &InstanceManifest) -> ControlResult<ConfigChanges> {
        let key = InstanceKey::from_manifest(manifest, &self.config);
        self.operation(&key, "create", |operation_id| {
            self.create_inner(manifest, operation_id)
        })
        .await
    }

    /// Reconcile the configuration of an existing instance
    pub async fn configure(&self, manifest: &InstanceManifest) -> ControlResult<ApplyResult> {
        let key = InstanceKey::from_manifest(manifest, &self.config);
        self.operation(&key, "configure", |_| async move {
            let key = InstanceKey::from_manifest(manifest, &self.config);
            let (instance, mut machine) = self.load(&key).await?;
            let (changes, pending_restart) =
                self.reconfigure(manifest, &instance, &mut machine).await?;
            self.store(machine);
            Ok(ApplyResult {
                change_state: (!changes.is_empty()).then_some(ChangeState::Changed),
                changes,
                pending_restart,
                drop_report: None,
            })
        })
        .await
    }

    pub async fn start(&self, key: &InstanceKey, options: &StartOptions) -> ControlResult<()> {
        self.operation(key, "start", |_| async move {
            let (instance, mut machine) = self.load(key).await?;
            self.start_inner(&instance, &mut machine, options).await?;
            self.store(machine);
            Ok(())
        })
        .await
    }

    pub async fn stop(&self, key: &InstanceKey, options: &StopOptions) -> ControlResult<()> {
        self.operation(key, "stop", |_| async move {
            let (instance, mut machine) = self.load(key).await?;
            self.stop_inner(&instance, &mut machine, options).await?;
            self.store(machine);
            Ok(())
        })
        .await
    }

    pub async fn restart(&self, key: &InstanceKey, mode: StopMode, wait: bool) -> ControlResult<()> {
        self.operation(key, "restart", |_| async move {
            let (instance, mut machine) = self.load(key).await?;
            self.restart_inner(&instance, &mut machine, mode, wait)
                .await?;
            self.store(machine);
            Ok(())
        })
        .await
    }

    pub async fn reload(&self, key: &InstanceKey) -> ControlResult<()> {
        self.operation(key, "reload", |_| async move {
            let (instance, mut machine) = self.load(key).await?;
            self.reload_inner(&instance, &mut machine).await?;
            self.store(machine);
            Ok(())
        })
        .await
    }

    /// Promote a standby; refused when an HA coordinator manages the instance
    pub async fn promote(&self, key: &InstanceKey) -> ControlResult<()> {
        self.operation(key, "promote", |_| async move {
            let (instance, machine) = self.load(key).await?;
            let mut next = machine.clone();
            next.transition(InstanceEvent::Promote)?;

            let instance = &instance;
            let claimed = self
                .registry
                .call_first(HookName::PromotePostgresql, |svc| {
                    async move { svc.promote_postgresql(instance).await }.boxed()
                })
                .await?;
            Self::claimed(claimed, "promote", instance)?;
            info!(instance = %instance, "instance promoted");
            self.store(next);
            Ok(())
        })
        .await
    }

    /// Tear down satellite services, stop the server and remove its directories
    pub async fn drop(&self, key: &InstanceKey) -> ControlResult<DropReport> {
        self.operation(key, "drop", |_| async move {
            let (instance, mut machine) = self.load(key).await?;
            let report = self.drop_inner(&instance, &mut machine).await?;
            self.store(machine);
            Ok(report)
        })
        .await
    }

    /// Describe an instance and what each service reports about it
    pub async fn get(&self, key: &InstanceKey) -> ControlResult<InstanceInfo> {
        self.operation(key, "get", |_| async move {
            let instance = Instance::load(key, &self.config).await?;
            let services = self.statuses(&instance).await?;
            let coordinator_managed = self.coordinator_managed(&instance).await?;
            let machine = self.sync_machine(&instance, &services, coordinator_managed);
            let info = InstanceInfo {
                key: instance.key.clone(),
                port: instance.port,
                datadir: instance.datadir.clone(),
                role: machine.role(),
                state: machine.current_state(),
                coordinator_managed,
                services,
            };
            self.store(machine);
            Ok(info)
        })
        .await
    }

    /// Transitions recorded for an instance by this orchestrator
    pub fn history(&self, key: &InstanceKey) -> Vec<TransitionRecord> {
        self.states
            .lock()
            .get(key)
            .map(|machine| machine.history().to_vec())
            .unwrap_or_default()
    }

    /// Run `body` under the instance lock inside an operation span
    async fn operation<T, F, Fut>(
        &self,
        key: &InstanceKey,
        name: &'static str,
        body: F,
    ) -> ControlResult<T>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        let operation_id = Uuid::new_v4();
        let span = info_span!(
            "instance_operation",
            operation = name,
            instance = %key,
            operation_id = %operation_id
        );
        async move {
            let _guard = self.lock(key).await;
            let instance = key.to_string();
            let id = operation_id.to_string();
            log_instance_operation(name, &instance, Some(id.as_str()), "started", None);

            let result = body(operation_id).await;
            match &result {
                Ok(_) => {
                    log_instance_operation(name, &instance, Some(id.as_str()), "completed", None)
                }
                Err(e) => log_error("orchestrator", name, &e.to_string(), Some(instance.as_str())),
            }
            result.map_err(|e| e.during(key, name))
        }
        .instrument(span)
        .await
    }

    async fn lock(&self, key: &InstanceKey) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    fn store(&self, machine: InstanceStateMachine) {
        self.states.lock().insert(machine.key().clone(), machine);
    }

    /// Load an existing instance and its state machine, synchronized with the host
    async fn load(&self, key: &InstanceKey) -> ControlResult<(Instance, InstanceStateMachine)> {
        let instance = Instance::load(key, &self.config).await?;
        let statuses = self.statuses(&instance).await?;
        let managed = self.coordinator_managed(&instance).await?;
        let machine = self.sync_machine(&instance, &statuses, managed);
        Ok((instance, machine))
    }

    fn sync_machine(
        &self,
        instance: &Instance,
        statuses: &[ServiceStatus],
        coordinator_managed: bool,
    ) -> InstanceStateMachine {
        let observed = if statuses.iter().any(|s| s.status == RunStatus::Running) {
            InstanceState::Running
        } else {
            InstanceState::Stopped
        };
        let role = if instance.is_standby() {
            Role::Standby
        } else {
            Role::Primary
        };

        let cached = self.states.lock().get(&instance.key).cloned();
        let mut machine = match cached {
            Some(machine) if matches_observed(&machine, observed, role) => machine,
            Some(machine) => {
                debug!(
                    instance = %instance,
                    recorded = %machine.current_state(),
                    observed = %observed,
                    "instance state changed outside of this orchestrator"
                );
                InstanceStateMachine::restore(instance.key.clone(), observed, role)
            }
            None => InstanceStateMachine::restore(instance.key.clone(), observed, role),
        };
        machine.set_coordinator_managed(coordinator_managed);
        machine
    }

    async fn statuses(&self, instance: &Instance) -> ControlResult<Vec<ServiceStatus>> {
        self.registry
            .call_all(HookName::InstanceStatus, |svc| {
                async move { svc.instance_status(instance).await }.boxed()
            })
            .await
    }

    async fn coordinator_managed(&self, instance: &Instance) -> ControlResult<bool> {
        self.registry
            .call_any(HookName::CoordinatorManaged, |svc| {
                async move { svc.coordinator_managed(instance).await }.boxed()
            })
            .await
    }

    fn claimed(claimed: Option<bool>, operation: &str, instance: &Instance) -> ControlResult<()> {
        match claimed {
            Some(_) => Ok(()),
            None => Err(ControlError::Unsupported(format!(
                "no registered service can {operation} instance {instance}"
            ))),
        }
    }

    async fn create_inner(
        &self,
        manifest: &InstanceManifest,
        operation_id: Uuid,
    ) -> ControlResult<ConfigChanges> {
        let instance = Instance::from_manifest(manifest, &self.config);
        if Instance::is_initialized(&instance.datadir).await {
            return Err(ControlError::invalid_state(&instance, "instance already exists"));
        }
        let role = if instance.is_standby() {
            Role::Standby
        } else {
            Role::Primary
        };
        let mut machine = InstanceStateMachine::new(instance.key.clone(), role);
        machine.transition(InstanceEvent::Create)?;

        let instance = &instance;
        let configured = parking_lot::Mutex::new(ConfigChanges::new());
        let configured_ref = &configured;
        let start_options = StartOptions::default();
        let stop_options = StopOptions::default();
        let (start_options, stop_options) = (&start_options, &stop_options);

        let mut pipeline = Pipeline::new(format!("creating instance {instance}"))
            .with_operation_id(operation_id)
            .task(
                Task::new(format!("allocating directories of {instance}"), move || {
                    async move {
                        create_private_dir(&instance.datadir).await?;
                        create_private_dir(&instance.waldir).await
                    }
                    .boxed()
                })
                .with_revert(move |()| async move { remove_instance_dirs(instance).await }.boxed()),
            )
            .task(
                Task::new(format!("initializing {instance}"), move || {
                    async move {
                        let claimed = match self
                            .registry
                            .call_first(HookName::InitPostgresql, |svc| {
                                async move { svc.init_postgresql(manifest, instance).await }.boxed()
                            })
                            .await
                        {
                            Ok(claimed) => claimed,
                            Err(err) => {
                                // a service may have left files or processes behind before failing
                                if let Err(teardown_err) = self.revert_initialization(instance).await {
                                    warn!(instance = %instance, error = %teardown_err, "teardown after failed initialization failed");
                                }
                                return Err(err);
                            }
                        };
                        Self::claimed(claimed, "initialize", instance)
                    }
                    .boxed()
                })
                .with_revert(move |()| async move { self.revert_initialization(instance).await }.boxed()),
            )
            .task(Task::new(format!("configuring {instance}"), move || {
                async move {
                    let changes = self.configure_instance(manifest, instance).await?;
                    *configured_ref.lock() = changes;
                    Ok(())
                }
                .boxed()
            }))
            .task(Task::new(
                format!("configuring authentication of {instance}"),
                move || {
                    async move {
                        self.registry
                            .call_first(HookName::ConfigureAuth, |svc| {
                                async move { svc.configure_auth(manifest, instance).await }.boxed()
                            })
                            .await?;
                        Ok(())
                    }
                    .boxed()
                },
            ));

        if manifest.state == DesiredState::Started {
            pipeline = pipeline.task(
                Task::new(format!("starting {instance}"), move || {
                    async move {
                        let claimed = self
                            .registry
                            .call_first(HookName::StartPostgresql, |svc| {
                                async move { svc.start_postgresql(instance, start_options).await }
                                    .boxed()
                            })
                            .await?;
                        Self::claimed(claimed, "start", instance)
                    }
                    .boxed()
                })
                .with_revert(move |()| {
                    async move {
                        self.registry
                            .call_first(HookName::StopPostgresql, |svc| {
                                async move { svc.stop_postgresql(instance, stop_options).await }
                                    .boxed()
                            })
                            .await?;
                        Ok(())
                    }
                    .boxed()
                }),
            );
        }

        if let Err(e) = pipeline.run().await {
            if let Err(sm) = machine.transition(InstanceEvent::Fail(e.to_string())) {
                warn!(instance = %instance, error = %sm, "could not record failed creation");
            }
            self.store(machine);
            return Err(e);
        }

        machine.transition(InstanceEvent::Configured)?;
        if manifest.state == DesiredState::Started {
            machine.transition(InstanceEvent::Start)?;
        }
        self.store(machine);
        info!(instance = %instance, "instance created");
        Ok(configured.into_inner())
    }

    /// Desired configuration: site settings, then service contributions, then the manifest
    async fn desired_settings(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<Settings> {
        let mut base = self.config.postgresql.settings.clone();
        base.insert("port".to_string(), SettingValue::Int(i64::from(manifest.port)));
        if let Some(locale) = manifest
            .locale
            .as_ref()
            .or(self.config.postgresql.initdb.locale.as_ref())
        {
            for key in ["lc_messages", "lc_monetary", "lc_numeric", "lc_time"] {
                base.insert(key.to_string(), SettingValue::Str(locale.clone()));
            }
        }
        base.insert(
            "unix_socket_directories".to_string(),
            SettingValue::Str(instance.socket_directory.to_string_lossy().into_owned()),
        );

        let mut contributions = self
            .registry
            .call_all(HookName::InstanceSettings, |svc| {
                async move { svc.instance_settings(manifest, instance).await }.boxed()
            })
            .await?;
        contributions.push(manifest.settings.clone());

        let mut settings = merge(&base, &contributions);
        resolve_memory_percentages(&mut settings, self.memory.total_bytes())?;
        Ok(settings)
    }

    /// Write the configuration through its owner and notify the other services
    async fn configure_instance(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
    ) -> ControlResult<ConfigChanges> {
        let desired = self.desired_settings(manifest, instance).await?;
        let desired = &desired;
        let changes = self
            .registry
            .call_first(HookName::ConfigurePostgresql, |svc| {
                async move { svc.configure_postgresql(desired, manifest, instance).await }.boxed()
            })
            .await?
            .unwrap_or_default();

        let changes_ref = &changes;
        self.registry
            .call_all(HookName::PostgresqlConfigured, |svc| {
                async move {
                    svc.postgresql_configured(manifest, instance, changes_ref)
                        .await
                }
                .boxed()
            })
            .await?;
        Ok(changes)
    }

    /// Configure an existing instance, then reload or restart when it runs
    async fn reconfigure(
        &self,
        manifest: &InstanceManifest,
        instance: &Instance,
        machine: &mut InstanceStateMachine,
    ) -> ControlResult<(ConfigChanges, Vec<String>)> {
        let mut next = machine.clone();
        next.transition(InstanceEvent::Configured)?;
        let changes = self.configure_instance(manifest, instance).await?;
        *machine = next;

        if changes.is_empty() || machine.current_state() != InstanceState::Running {
            return Ok((changes, Vec::new()));
        }

        let pending = restart_required(&changes, &self.config.postgresql.restart_required_keys);
        if pending.is_empty() {
            self.reload_inner(instance, machine).await?;
            return Ok((changes, pending));
        }
        if manifest.restart_on_changes {
            self.restart_inner(instance, machine, StopMode::Fast, true)
                .await?;
            return Ok((changes, Vec::new()));
        }
        warn!(
            instance = %instance,
            settings = ?pending,
            "instance needs a restart for changes to take effect"
        );
        Ok((changes, pending))
    }

    async fn start_inner(
        &self,
        instance: &Instance,
        machine: &mut InstanceStateMachine,
        options: &StartOptions,
    ) -> ControlResult<()> {
        let mut next = machine.clone();
        next.transition(InstanceEvent::Start)?;
        let claimed = self
            .registry
            .call_first(HookName::StartPostgresql, |svc| {
                async move { svc.start_postgresql(instance, options).await }.boxed()
            })
            .await?;
        Self::claimed(claimed, "start", instance)?;
        *machine = next;
        Ok(())
    }

    async fn stop_inner(
        &self,
        instance: &Instance,
        machine: &mut InstanceStateMachine,
        options: &StopOptions,
    ) -> ControlResult<()> {
        let mut next = machine.clone();
        next.transition(InstanceEvent::Stop)?;
        let claimed = self
            .registry
            .call_first(HookName::StopPostgresql, |svc| {
                async move { svc.stop_postgresql(instance, options).await }.boxed()
            })
            .await?;
        Self::claimed(claimed, "stop", instance)?;
        *machine = next;
        Ok(())
    }

    async fn restart_inner(
        &self,
        instance: &Instance,
        machine: &mut InstanceStateMachine,
        mode: StopMode,
        wait: bool,
    ) -> ControlResult<()> {
        let mut next = machine.clone();
        next.transition(InstanceEvent::Restart)?;
        let claimed = self
            .registry
            .call_first(HookName::RestartPostgresql, |svc| {
                async move { svc.restart_postgresql(instance, mode, wait).await }.boxed()
            })
            .await?;
        Self::claimed(claimed, "restart", instance)?;
        *machine = next;
        Ok(())
    }

    async fn reload_inner(
        &self,
        instance: &Instance,
        machine: &mut InstanceStateMachine,
    ) -> ControlResult<()> {
        let mut next = machine.clone();
        next.transition(InstanceEvent::Reload)?;
        let claimed = self
            .registry
            .call_first(HookName::ReloadPostgresql, |svc| {
                async move { svc.reload_postgresql(instance).await }.boxed()
            })
            .await?;
        Self::claimed(claimed, "reload", instance)?;
        *machine = next;
        Ok(())
    }

    async fn drop_inner(
        &self,
        instance: &Instance,
        machine: &mut InstanceStateMachine,
    ) -> ControlResult<DropReport> {
        let mut next = machine.clone();
        next.transition(InstanceEvent::Drop)?;

        // Teardown first so a coordinator can still see its cluster
        let report = self.teardown(instance).await?;

        let still_running = self
            .statuses(instance)
            .await?
            .iter()
            .any(|s| s.status == RunStatus::Running);
        if still_running {
            let options = StopOptions {
                mode: StopMode::Fast,
                wait: true,
            };
            let options = &options;
            self.registry
                .call_first(HookName::StopPostgresql, |svc| {
                    async move { svc.stop_postgresql(instance, options).await }.boxed()
                })
                .await?;
        }

        remove_instance_dirs(instance).await?;
        *machine = next;
        info!(
            instance = %instance,
            cleaned = ?report.cleaned,
            failures = report.failures.len(),
            "instance dropped"
        );
        Ok(report)
    }

    /// Run every teardown hook, collecting failures instead of stopping at one
    async fn revert_initialization(&self, instance: &Instance) -> ControlResult<()> {
        let report = self.teardown(instance).await?;
        if !report.is_clean() {
            warn!(instance = %instance, failures = report.failures.len(), "teardown incomplete while reverting");
        }
        Ok(())
    }

    async fn teardown(&self, instance: &Instance) -> ControlResult<DropReport> {
        let outcomes = self
            .registry
            .call_all_settled(HookName::InstanceDropped, |svc| {
                async move { svc.instance_dropped(instance).await }.boxed()
            })
            .await?;

        let mut report = DropReport {
            instance: instance.key.clone(),
            cleaned: Vec::new(),
            failures: Vec::new(),
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(Some(())) => report.cleaned.push(outcome.service),
                Ok(None) => {}
                Err(e) => report.failures.push(TeardownFailure {
                    service: outcome.service,
                    kind: e.kind(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(report)
    }
}

fn matches_observed(machine: &InstanceStateMachine, observed: InstanceState, role: Role) -> bool {
    let state = machine.current_state();
    let same_state = state == observed
        || (state == InstanceState::Configured && observed == InstanceState::Stopped);
    same_state && machine.role() == role
}

async fn create_private_dir(path: &Path) -> ControlResult<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(path)
        .await
        .map_err(|e| ControlError::io(path, e))
}

async fn remove_dir(path: &Path) -> ControlResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ControlError::io(path, e)),
    }
}

/// Remove data and WAL directories, and their instance directory when emptied
async fn remove_instance_dirs(instance: &Instance) -> ControlResult<()> {
    remove_dir(&instance.datadir).await?;
    remove_dir(&instance.waldir).await?;
    if let Some(base) = instance.datadir.parent() {
        if let Err(e) = tokio::fs::remove_dir(base).await {
            debug!(path = %base.display(), error = %e, "instance directory kept");
        }
    }
    Ok(())
}
