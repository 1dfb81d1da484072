use super::states::InstanceState;
use crate::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event '{event}'")]
    InvalidTransition { from: InstanceState, event: String },

    #[error("Guard check failed: {0}")]
    GuardFailed(#[from] GuardError),

    #[error("Instance is in terminal state {0}")]
    Terminal(InstanceState),
}

impl StateMachineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GuardFailed(GuardError::Unsupported { .. }) => ErrorKind::Unsupported,
            _ => ErrorKind::StateConflict,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    #[error("Operation not supported: {reason}")]
    Unsupported { reason: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}

pub fn unsupported(reason: impl Into<String>) -> GuardError {
    GuardError::Unsupported {
        reason: reason.into(),
    }
}
