use serde::{Deserialize, Serialize};

/// Events that drive instance state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InstanceEvent {
    /// Begin the creation pipeline
    Create,
    /// Configuration written (after creation or a reconfigure)
    Configured,
    Start,
    Stop,
    Restart,
    Reload,
    /// Standby becomes primary
    Promote,
    Drop,
    /// Creation failed and was rolled back
    Fail(String),
}

impl InstanceEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Configured => "configured",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::Promote => "promote",
            Self::Drop => "drop",
            Self::Fail(_) => "fail",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}
