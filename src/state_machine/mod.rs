//! # Instance State Machine
//!
//! Lifecycle states of a PostgreSQL instance, the events that move between
//! them, and guards that reject operations invalid for the instance's role or
//! management mode. Transitions are tracked in memory per instance; the
//! filesystem stays the source of truth and is re-read on discovery.

pub mod errors;
pub mod events;
pub mod guards;
pub mod instance_state_machine;
pub mod states;

pub use errors::{GuardError, StateMachineError, StateMachineResult};
pub use events::InstanceEvent;
pub use guards::{GuardContext, InstanceGuard};
pub use instance_state_machine::{InstanceStateMachine, TransitionRecord};
pub use states::{InstanceState, Role};
