//! # Satellite Service Registry
//!
//! Hook names with their dispatch policies, the [`SatelliteService`] contract,
//! and the [`HookRegistry`] that orders and dispatches implementations.

pub mod hook_registry;
pub mod hooks;
pub mod satellite;

pub use hook_registry::{HookError, HookRegistry, Priority, Settled};
pub use hooks::{CombinePolicy, FailureMode, HookName, HookSpec};
pub use satellite::SatelliteService;
