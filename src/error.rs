//! # Error Types
//!
//! Structured error handling for the reconciliation core. Every fallible
//! operation returns [`ControlResult`], and callers branch on
//! [`ControlError::kind`] rather than on individual variants.

use crate::config::ConfigurationError;
use crate::registry::HookError;
use crate::state_machine::StateMachineError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Instance or database does not exist
    NotFound,
    /// Operation is invalid for the current state or role
    StateConflict,
    /// Readiness or teardown deadline exceeded
    Transient,
    /// An external program exited non-zero
    CommandFailure,
    /// Operation not supported in the current setup
    Unsupported,
    /// Host-level failure (I/O, unreachable service)
    System,
    /// Invalid configuration or settings
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::StateConflict => "state_conflict",
            Self::Transient => "transient",
            Self::CommandFailure => "command_failure",
            Self::Unsupported => "unsupported",
            Self::System => "system",
            Self::Configuration => "configuration",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("invalid state for {entity}: {reason}")]
    InvalidState { entity: String, reason: String },

    #[error("instance {0} is a read-only standby")]
    InstanceReadOnly(String),

    #[error("{operation}: gave up after {attempts} attempts in {elapsed:?} ({last_reason})")]
    Timeout {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        last_reason: String,
    },

    #[error("command '{}' exited with status {code}", argv.join(" "))]
    Command {
        code: i32,
        argv: Vec<String>,
        stdout: String,
        stderr: String,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("system error: {0}")]
    System(String),

    #[error("{0} is unreachable")]
    Unreachable(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{operation} failed for instance {instance}: {source}")]
    Operation {
        instance: String,
        operation: String,
        #[source]
        source: Box<ControlError>,
    },
}

/// Result type for reconciliation operations
pub type ControlResult<T> = anyhow::Result<T, ControlError>;

impl ControlError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn invalid_state(entity: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }

    /// Classify this error for callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InstanceNotFound(_) | Self::DatabaseNotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } | Self::InstanceReadOnly(_) => ErrorKind::StateConflict,
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::Command { .. } => ErrorKind::CommandFailure,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::System(_) | Self::Unreachable(_) | Self::Io { .. } | Self::Database(_) => {
                ErrorKind::System
            }
            Self::Configuration(_) | Self::Hook(_) => ErrorKind::Configuration,
            Self::StateMachine(e) => e.kind(),
            Self::Operation { source, .. } => source.kind(),
        }
    }

    /// Attach the instance and operation that were running when this error surfaced.
    ///
    /// Errors already attributed to the same instance are returned unchanged.
    pub fn during(self, instance: impl fmt::Display, operation: &str) -> Self {
        let instance = instance.to_string();
        if let Self::Operation {
            instance: existing, ..
        } = &self
        {
            if *existing == instance {
                return self;
            }
        }
        Self::Operation {
            instance,
            operation: operation.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping operation context
    pub fn root(&self) -> &ControlError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the failure means a peer service is not listening
    pub fn is_unreachable(&self) -> bool {
        matches!(self.root(), Self::Unreachable(_))
    }
}
