use super::errors::{business_rule_violation, unsupported, GuardResult};
use super::states::{InstanceState, Role};
use crate::models::InstanceKey;

/// Facts a guard may consult
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub instance: &'a InstanceKey,
    pub state: InstanceState,
    pub role: Role,
    /// An HA coordinator controls this instance's lifecycle
    pub coordinator_managed: bool,
}

/// Trait for implementing state transition guards
pub trait InstanceGuard: Send + Sync {
    fn check(&self, ctx: &GuardContext<'_>) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Only a standby can be promoted
pub struct PromoteRequiresStandby;

impl InstanceGuard for PromoteRequiresStandby {
    fn check(&self, ctx: &GuardContext<'_>) -> GuardResult<()> {
        match ctx.role {
            Role::Standby => Ok(()),
            Role::Primary => Err(business_rule_violation(format!(
                "instance {} is not a standby",
                ctx.instance
            ))),
        }
    }

    fn description(&self) -> &'static str {
        "Instance must be a standby"
    }
}

/// Operations the HA coordinator owns cannot be run directly
pub struct NotCoordinatorManaged {
    pub operation: &'static str,
}

impl InstanceGuard for NotCoordinatorManaged {
    fn check(&self, ctx: &GuardContext<'_>) -> GuardResult<()> {
        if ctx.coordinator_managed {
            return Err(unsupported(format!(
                "{} of instance {} is handled by its HA coordinator",
                self.operation, ctx.instance
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Instance must not be managed by an HA coordinator"
    }
}

/// Reload only makes sense for a running server
pub struct RequiresRunning;

impl InstanceGuard for RequiresRunning {
    fn check(&self, ctx: &GuardContext<'_>) -> GuardResult<()> {
        if ctx.state.is_active() {
            return Ok(());
        }
        Err(business_rule_violation(format!(
            "instance {} is {}, not running",
            ctx.instance, ctx.state
        )))
    }

    fn description(&self) -> &'static str {
        "Instance must be running"
    }
}
