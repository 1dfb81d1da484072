//! # Hook Registry
//!
//! Ordered registration of satellite services per hook and dispatch under the
//! hook's combine policy.
//!
//! ## Ordering
//!
//! Implementations run sequentially. Within a hook, normal-priority services
//! run in registration order, then run-last services in registration order.
//! The builtin PostgreSQL service registers as run-last so that any satellite
//! claiming a first-non-null hook (an HA coordinator starting the instance,
//! for example) wins over the default behavior.
//!
//! ## Usage
//!
//! ```rust
//! use pgcontrol_core::registry::{HookName, HookRegistry, Priority, SatelliteService};
//! use pgcontrol_core::models::Instance;
//! use pgcontrol_core::error::ControlResult;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Watchdog;
//!
//! #[async_trait]
//! impl SatelliteService for Watchdog {
//!     fn name(&self) -> &str { "watchdog" }
//!     fn hooks(&self) -> &'static [HookName] { &[HookName::CoordinatorManaged] }
//!     async fn coordinator_managed(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
//!         Ok(Some(false))
//!     }
//! }
//!
//! let registry = HookRegistry::new();
//! registry.register(Arc::new(Watchdog), Priority::Normal).unwrap();
//! assert_eq!(registry.implementations(HookName::CoordinatorManaged), vec!["watchdog"]);
//! ```

use super::hooks::{CombinePolicy, FailureMode, HookName};
use super::satellite::SatelliteService;
use crate::error::{ControlError, ControlResult};
use crate::logging::log_hook_dispatch;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("service '{service}' is already registered for hook {hook}")]
    DuplicateRegistration { hook: HookName, service: String },

    #[error("hook {hook} uses the {expected} policy, not {requested}")]
    PolicyMismatch {
        hook: HookName,
        expected: CombinePolicy,
        requested: CombinePolicy,
    },

    #[error("hook {hook} {reason}")]
    FailureModeMismatch { hook: HookName, reason: &'static str },

    #[error("registry is frozen, cannot register '{service}'")]
    Frozen { service: String },
}

/// Registration priority within a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Runs after every normal-priority implementation
    RunLast,
}

/// Outcome of one implementation under a collecting failure mode
#[derive(Debug)]
pub struct Settled<T> {
    pub service: String,
    pub result: ControlResult<Option<T>>,
}

type ServiceRef = Arc<dyn SatelliteService>;

#[derive(Default)]
struct HookEntries {
    normal: Vec<ServiceRef>,
    run_last: Vec<ServiceRef>,
}

impl HookEntries {
    fn contains(&self, name: &str) -> bool {
        self.normal
            .iter()
            .chain(self.run_last.iter())
            .any(|service| service.name() == name)
    }

    fn ordered(&self) -> Vec<ServiceRef> {
        self.normal
            .iter()
            .chain(self.run_last.iter())
            .cloned()
            .collect()
    }
}

/// Registry of satellite services keyed by hook
#[derive(Default)]
pub struct HookRegistry {
    entries: RwLock<HashMap<HookName, HookEntries>>,
    frozen: AtomicBool,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close registration and share the registry
    pub fn freeze(self) -> Arc<Self> {
        self.frozen.store(true, Ordering::Release);
        debug!(registry = ?self, "Hook registry frozen");
        Arc::new(self)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Register a service for every hook it declares
    pub fn register(&self, service: ServiceRef, priority: Priority) -> Result<(), HookError> {
        if self.is_frozen() {
            return Err(HookError::Frozen {
                service: service.name().to_string(),
            });
        }
        let hooks = service.hooks();
        {
            let entries = self.entries.read();
            for hook in hooks {
                if entries
                    .get(hook)
                    .is_some_and(|existing| existing.contains(service.name()))
                {
                    return Err(HookError::DuplicateRegistration {
                        hook: *hook,
                        service: service.name().to_string(),
                    });
                }
            }
        }
        for hook in hooks {
            self.register_hook(*hook, Arc::clone(&service), priority)?;
        }
        info!(
            service = service.name(),
            hooks = hooks.len(),
            ?priority,
            "Registered satellite service"
        );
        Ok(())
    }

    /// Register a service for a single hook
    pub fn register_hook(
        &self,
        hook: HookName,
        service: ServiceRef,
        priority: Priority,
    ) -> Result<(), HookError> {
        if self.is_frozen() {
            return Err(HookError::Frozen {
                service: service.name().to_string(),
            });
        }
        let mut entries = self.entries.write();
        let slot = entries.entry(hook).or_default();
        if slot.contains(service.name()) {
            return Err(HookError::DuplicateRegistration {
                hook,
                service: service.name().to_string(),
            });
        }
        debug!(hook = %hook, service = service.name(), ?priority, "Registered hook implementation");
        match priority {
            Priority::Normal => slot.normal.push(service),
            Priority::RunLast => slot.run_last.push(service),
        }
        Ok(())
    }

    /// Service names for a hook in dispatch order
    pub fn implementations(&self, hook: HookName) -> Vec<String> {
        self.snapshot(hook)
            .iter()
            .map(|service| service.name().to_string())
            .collect()
    }

    /// First implementation that returns a value wins; later ones are not called
    pub async fn call_first<'a, T, F>(&self, hook: HookName, f: F) -> ControlResult<Option<T>>
    where
        F: Fn(ServiceRef) -> BoxFuture<'a, ControlResult<Option<T>>>,
    {
        self.expect_policy(hook, CombinePolicy::FirstNonNull, FailureMode::Abort)?;
        let services = self.snapshot(hook);
        let total = services.len();
        for service in services {
            let name = service.name().to_string();
            if let Some(value) = f(service).await? {
                debug!(hook = %hook, service = %name, "hook claimed");
                log_hook_dispatch(hook.as_str(), "first_non_null", total, 1);
                return Ok(Some(value));
            }
        }
        log_hook_dispatch(hook.as_str(), "first_non_null", total, 0);
        Ok(None)
    }

    /// Every implementation runs; non-null results are kept in dispatch order
    pub async fn call_all<'a, T, F>(&self, hook: HookName, f: F) -> ControlResult<Vec<T>>
    where
        F: Fn(ServiceRef) -> BoxFuture<'a, ControlResult<Option<T>>>,
    {
        self.expect_policy(hook, CombinePolicy::CollectAll, FailureMode::Abort)?;
        let services = self.snapshot(hook);
        let total = services.len();
        let mut results = Vec::with_capacity(total);
        for service in services {
            if let Some(value) = f(service).await? {
                results.push(value);
            }
        }
        log_hook_dispatch(hook.as_str(), "collect_all", total, results.len());
        Ok(results)
    }

    /// True as soon as one implementation answers true
    pub async fn call_any<'a, F>(&self, hook: HookName, f: F) -> ControlResult<bool>
    where
        F: Fn(ServiceRef) -> BoxFuture<'a, ControlResult<Option<bool>>>,
    {
        self.expect_policy(hook, CombinePolicy::BooleanAny, FailureMode::Abort)?;
        let services = self.snapshot(hook);
        let total = services.len();
        for service in services {
            if f(service).await? == Some(true) {
                log_hook_dispatch(hook.as_str(), "boolean_any", total, 1);
                return Ok(true);
            }
        }
        log_hook_dispatch(hook.as_str(), "boolean_any", total, 0);
        Ok(false)
    }

    /// Every implementation runs even when some fail; each outcome is returned
    pub async fn call_all_settled<'a, T, F>(&self, hook: HookName, f: F) -> ControlResult<Vec<Settled<T>>>
    where
        F: Fn(ServiceRef) -> BoxFuture<'a, ControlResult<Option<T>>>,
    {
        self.expect_policy(hook, CombinePolicy::CollectAll, FailureMode::Collect)?;
        let services = self.snapshot(hook);
        let total = services.len();
        let mut outcomes = Vec::with_capacity(total);
        for service in services {
            let name = service.name().to_string();
            let result = f(service).await;
            if let Err(e) = &result {
                warn!(hook = %hook, service = %name, error = %e, "hook implementation failed");
            }
            outcomes.push(Settled {
                service: name,
                result,
            });
        }
        let answered = outcomes.iter().filter(|o| o.result.is_ok()).count();
        log_hook_dispatch(hook.as_str(), "collect_all", total, answered);
        Ok(outcomes)
    }

    fn snapshot(&self, hook: HookName) -> Vec<ServiceRef> {
        self.entries
            .read()
            .get(&hook)
            .map(HookEntries::ordered)
            .unwrap_or_default()
    }

    fn expect_policy(
        &self,
        hook: HookName,
        requested: CombinePolicy,
        on_error: FailureMode,
    ) -> ControlResult<()> {
        let spec = hook.spec();
        if spec.policy != requested {
            return Err(ControlError::Hook(HookError::PolicyMismatch {
                hook,
                expected: spec.policy,
                requested,
            }));
        }
        if spec.on_error != on_error {
            let reason = match spec.on_error {
                FailureMode::Collect => "collects errors and must be dispatched with call_all_settled",
                FailureMode::Abort => "aborts on error and cannot be dispatched with call_all_settled",
            };
            return Err(ControlError::Hook(HookError::FailureModeMismatch { hook, reason }));
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read();
        let mut map = f.debug_map();
        for (hook, slot) in entries.iter() {
            let names: Vec<&str> = slot
                .normal
                .iter()
                .chain(slot.run_last.iter())
                .map(|service| service.name())
                .collect();
            map.entry(hook, &names);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Instance, InstanceManifest};
    use crate::config::ControlConfig;
    use async_trait::async_trait;
    use futures::FutureExt;

    struct Fixed {
        name: &'static str,
        managed: Option<bool>,
    }

    #[async_trait]
    impl SatelliteService for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn hooks(&self) -> &'static [HookName] {
            &[HookName::CoordinatorManaged, HookName::ReloadPostgresql]
        }

        async fn coordinator_managed(&self, _instance: &Instance) -> ControlResult<Option<bool>> {
            Ok(self.managed)
        }
    }

    fn instance() -> Instance {
        Instance::from_manifest(&InstanceManifest::new("main"), &ControlConfig::default())
    }

    #[test]
    fn test_run_last_ordering() {
        let registry = HookRegistry::new();
        registry
            .register(Arc::new(Fixed { name: "builtin", managed: None }), Priority::RunLast)
            .unwrap();
        registry
            .register(Arc::new(Fixed { name: "first", managed: None }), Priority::Normal)
            .unwrap();
        registry
            .register(Arc::new(Fixed { name: "second", managed: None }), Priority::Normal)
            .unwrap();
        assert_eq!(
            registry.implementations(HookName::CoordinatorManaged),
            vec!["first", "second", "builtin"]
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = HookRegistry::new();
        registry
            .register(Arc::new(Fixed { name: "patroni", managed: None }), Priority::Normal)
            .unwrap();
        let err = registry
            .register(Arc::new(Fixed { name: "patroni", managed: None }), Priority::RunLast)
            .unwrap_err();
        assert!(matches!(err, HookError::DuplicateRegistration { .. }));
        assert_eq!(registry.implementations(HookName::ReloadPostgresql).len(), 1);
    }

    #[test]
    fn test_frozen_registry_rejects_registration() {
        let registry = HookRegistry::new();
        registry
            .register(Arc::new(Fixed { name: "a", managed: None }), Priority::Normal)
            .unwrap();
        let registry = registry.freeze();
        let err = registry
            .register(Arc::new(Fixed { name: "b", managed: None }), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, HookError::Frozen { .. }));
        assert_eq!(registry.implementations(HookName::ReloadPostgresql), vec!["a"]);
    }

    #[tokio::test]
    async fn test_call_any() {
        let registry = HookRegistry::new();
        registry
            .register(Arc::new(Fixed { name: "a", managed: Some(false) }), Priority::Normal)
            .unwrap();
        registry
            .register(Arc::new(Fixed { name: "b", managed: None }), Priority::Normal)
            .unwrap();
        let instance = instance();
        let managed = registry
            .call_any(HookName::CoordinatorManaged, |svc| {
                let instance = &instance;
                async move { svc.coordinator_managed(instance).await }.boxed()
            })
            .await
            .unwrap();
        assert!(!managed);

        registry
            .register(Arc::new(Fixed { name: "c", managed: Some(true) }), Priority::Normal)
            .unwrap();
        let managed = registry
            .call_any(HookName::CoordinatorManaged, |svc| {
                let instance = &instance;
                async move { svc.coordinator_managed(instance).await }.boxed()
            })
            .await
            .unwrap();
        assert!(managed);
    }

    #[tokio::test]
    async fn test_policy_mismatch() {
        let registry = HookRegistry::new();
        let instance = instance();
        let err = registry
            .call_all(HookName::ReloadPostgresql, |svc| {
                let instance = &instance;
                async move { svc.reload_postgresql(instance).await }.boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Hook(HookError::PolicyMismatch { .. })
        ));
    }
}
