use super::{
    errors::{StateMachineError, StateMachineResult},
    events::InstanceEvent,
    guards::{GuardContext, InstanceGuard, NotCoordinatorManaged, PromoteRequiresStandby, RequiresRunning},
    states::{InstanceState, Role},
};
use crate::models::InstanceKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: InstanceState,
    pub to: InstanceState,
    pub event: String,
    pub role: Role,
    pub at: DateTime<Utc>,
}

/// In-memory lifecycle tracker for one instance
#[derive(Debug, Clone)]
pub struct InstanceStateMachine {
    key: InstanceKey,
    state: InstanceState,
    role: Role,
    coordinator_managed: bool,
    history: Vec<TransitionRecord>,
}

impl InstanceStateMachine {
    /// Machine for an instance that does not exist yet
    pub fn new(key: InstanceKey, role: Role) -> Self {
        Self::restore(key, InstanceState::Absent, role)
    }

    /// Machine for an instance discovered in a given state
    pub fn restore(key: InstanceKey, state: InstanceState, role: Role) -> Self {
        Self {
            key,
            state,
            role,
            coordinator_managed: false,
            history: Vec::new(),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn current_state(&self) -> InstanceState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn set_coordinator_managed(&mut self, managed: bool) {
        self.coordinator_managed = managed;
    }

    /// Attempt a transition, recording it on success
    pub fn transition(&mut self, event: InstanceEvent) -> StateMachineResult<InstanceState> {
        let (target_state, target_role) = self.determine_target_state(&event)?;
        self.check_guards(&event)?;

        let record = TransitionRecord {
            from: self.state,
            to: target_state,
            event: event.event_type().to_string(),
            role: target_role,
            at: Utc::now(),
        };
        info!(
            instance = %self.key,
            from = %record.from,
            to = %record.to,
            event = %record.event,
            role = %record.role,
            "instance state transition"
        );
        self.history.push(record);
        self.state = target_state;
        self.role = target_role;
        Ok(target_state)
    }

    /// Resolve the target state and role for an event without applying it
    pub fn determine_target_state(
        &self,
        event: &InstanceEvent,
    ) -> StateMachineResult<(InstanceState, Role)> {
        use InstanceState::*;

        if self.state.is_terminal() {
            return Err(StateMachineError::Terminal(self.state));
        }

        let target = match (self.state, event) {
            (Absent, InstanceEvent::Create) => Creating,
            (Creating, InstanceEvent::Configured) => Configured,
            (Creating, InstanceEvent::Fail(_)) => Absent,

            // Reconfiguration keeps the runtime state
            (state @ (Configured | Running | Stopped), InstanceEvent::Configured) => state,

            (Configured | Stopped | Running, InstanceEvent::Start) => Running,
            (Configured | Stopped | Running, InstanceEvent::Stop) => Stopped,
            (Running, InstanceEvent::Restart) => Running,
            (Running, InstanceEvent::Reload) => Running,

            (state @ (Running | Stopped), InstanceEvent::Promote) => {
                return Ok((state, Role::Primary))
            }

            (Creating | Configured | Running | Stopped, InstanceEvent::Drop) => Dropped,

            (from, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok((target, self.role))
    }

    fn check_guards(&self, event: &InstanceEvent) -> StateMachineResult<()> {
        let ctx = GuardContext {
            instance: &self.key,
            state: self.state,
            role: self.role,
            coordinator_managed: self.coordinator_managed,
        };
        let guards: Vec<&dyn InstanceGuard> = match event {
            InstanceEvent::Promote => vec![
                &PromoteRequiresStandby,
                &NotCoordinatorManaged {
                    operation: "promote",
                },
            ],
            InstanceEvent::Reload => vec![&RequiresRunning],
            _ => Vec::new(),
        };
        for guard in guards {
            debug!(instance = %self.key, guard = guard.description(), "checking guard");
            guard.check(&ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::errors::GuardError;

    fn machine() -> InstanceStateMachine {
        InstanceStateMachine::new(InstanceKey::new("16", "main"), Role::Primary)
    }

    #[test]
    fn test_create_start_stop_drop() {
        let mut sm = machine();
        assert_eq!(sm.transition(InstanceEvent::Create).unwrap(), InstanceState::Creating);
        assert_eq!(
            sm.transition(InstanceEvent::Configured).unwrap(),
            InstanceState::Configured
        );
        assert_eq!(sm.transition(InstanceEvent::Start).unwrap(), InstanceState::Running);
        assert_eq!(sm.transition(InstanceEvent::Reload).unwrap(), InstanceState::Running);
        assert_eq!(sm.transition(InstanceEvent::Stop).unwrap(), InstanceState::Stopped);
        assert_eq!(sm.transition(InstanceEvent::Drop).unwrap(), InstanceState::Dropped);
        assert_eq!(sm.history().len(), 6);

        assert!(matches!(
            sm.transition(InstanceEvent::Start),
            Err(StateMachineError::Terminal(InstanceState::Dropped))
        ));
    }

    #[test]
    fn test_failed_creation_returns_to_absent() {
        let mut sm = machine();
        sm.transition(InstanceEvent::Create).unwrap();
        assert_eq!(
            sm.transition(InstanceEvent::Fail("initdb".into())).unwrap(),
            InstanceState::Absent
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut sm = machine();
        assert!(matches!(
            sm.transition(InstanceEvent::Start),
            Err(StateMachineError::InvalidTransition {
                from: InstanceState::Absent,
                ..
            })
        ));
        let mut stopped = InstanceStateMachine::restore(
            InstanceKey::new("16", "main"),
            InstanceState::Stopped,
            Role::Primary,
        );
        assert!(matches!(
            stopped.transition(InstanceEvent::Reload),
            Err(StateMachineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_promote_changes_role_only() {
        let mut sm = InstanceStateMachine::restore(
            InstanceKey::new("16", "replica"),
            InstanceState::Running,
            Role::Standby,
        );
        assert_eq!(sm.transition(InstanceEvent::Promote).unwrap(), InstanceState::Running);
        assert_eq!(sm.role(), Role::Primary);

        assert!(matches!(
            sm.transition(InstanceEvent::Promote),
            Err(StateMachineError::GuardFailed(GuardError::BusinessRuleViolation { .. }))
        ));
    }

    #[test]
    fn test_promote_rejected_when_coordinator_managed() {
        let mut sm = InstanceStateMachine::restore(
            InstanceKey::new("16", "replica"),
            InstanceState::Running,
            Role::Standby,
        );
        sm.set_coordinator_managed(true);
        let err = sm.transition(InstanceEvent::Promote).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
        assert_eq!(sm.role(), Role::Standby);
    }
}
