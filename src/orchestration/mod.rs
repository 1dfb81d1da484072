//! # Orchestration Engine
//!
//! Drives instances through their lifecycle by composing satellite service
//! hooks into revertible pipelines.
//!
//! ## Core Components
//!
//! - **Orchestrator**: public lifecycle operations (`apply`, `start`,
//!   `promote`, `drop`, ...) with per-instance exclusive locking
//! - **Pipeline / Task**: ordered steps with reverse-order compensation
//! - **ProcessRunner**: external programs without a shell, with typed failures
//! - **poll_until_ready**: bounded readiness polling with backoff
//! - **LogFollower**: tails a log file while an operation runs

pub mod log_follow;
pub mod orchestrator;
pub mod process;
pub mod retry;
pub mod task;

pub use log_follow::{follow_during, FollowReport, LogFollower};
pub use orchestrator::{ApplyResult, DropReport, Orchestrator, TeardownFailure};
pub use process::{CommandOutput, CommandSpec, ProcessRunner, SystemProcessRunner};
pub use retry::{poll_until_ready, ProbeOutcome, RetryPolicy, StopCondition};
pub use task::{Pipeline, PipelineReport, RevertibleStep, Task};
