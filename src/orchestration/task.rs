//! # Revertible Task Pipeline
//!
//! A pipeline runs titled steps in order. When step `k` fails, steps
//! `k-1..0` are reverted in reverse order and the original error is
//! returned. The failing step is not reverted; it is expected to leave no
//! partial state behind. Revert failures are logged and never replace the
//! original error.
//!
//! ```rust
//! use futures::FutureExt;
//! use pgcontrol_core::error::ControlError;
//! use pgcontrol_core::orchestration::{Pipeline, Task};
//!
//! # tokio_test::block_on(async {
//! let result = Pipeline::new("demo")
//!     .task(
//!         Task::new("allocate", || async { Ok::<_, ControlError>(7u32) }.boxed())
//!             .with_revert(|slot| async move {
//!                 println!("releasing slot {slot}");
//!                 Ok(())
//!             }.boxed()),
//!     )
//!     .task(Task::new("fail", || {
//!         async { Err::<(), _>(ControlError::system("boom")) }.boxed()
//!     }))
//!     .run()
//!     .await;
//! assert!(result.is_err());
//! # });
//! ```

use crate::error::{ControlError, ControlResult};
use crate::logging::log_task_step;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, warn};
use uuid::Uuid;

type ForwardFn<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, ControlResult<T>> + Send + 'a>;
type RevertFn<'a, T> = Box<dyn FnOnce(T) -> BoxFuture<'a, ControlResult<()>> + Send + 'a>;

/// Object-safe view of a pipeline step
#[async_trait]
pub trait RevertibleStep: Send {
    fn title(&self) -> &str;

    async fn run(&mut self) -> ControlResult<()>;

    /// Undo a successful `run`; a no-op when there is nothing to undo
    async fn revert(&mut self) -> ControlResult<()>;
}

/// A forward action with an optional revert receiving its output
pub struct Task<'a, T> {
    title: String,
    forward: Option<ForwardFn<'a, T>>,
    revert: Option<RevertFn<'a, T>>,
    output: Option<T>,
}

impl<'a, T: Send + 'a> Task<'a, T> {
    pub fn new<F>(title: impl Into<String>, forward: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'a, ControlResult<T>> + Send + 'a,
    {
        Self {
            title: title.into(),
            forward: Some(Box::new(forward)),
            revert: None,
            output: None,
        }
    }

    pub fn with_revert<R>(mut self, revert: R) -> Self
    where
        R: FnOnce(T) -> BoxFuture<'a, ControlResult<()>> + Send + 'a,
    {
        self.revert = Some(Box::new(revert));
        self
    }
}

#[async_trait]
impl<'a, T: Send + 'a> RevertibleStep for Task<'a, T> {
    fn title(&self) -> &str {
        &self.title
    }

    async fn run(&mut self) -> ControlResult<()> {
        let forward = self
            .forward
            .take()
            .ok_or_else(|| ControlError::system(format!("step '{}' already ran", self.title)))?;
        self.output = Some(forward().await?);
        Ok(())
    }

    async fn revert(&mut self) -> ControlResult<()> {
        match (self.revert.take(), self.output.take()) {
            (Some(revert), Some(output)) => revert(output).await,
            _ => Ok(()),
        }
    }
}

/// Titles of the steps a pipeline ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub operation_id: Uuid,
    pub completed: Vec<String>,
}

/// Ordered, all-or-nothing sequence of steps
pub struct Pipeline<'a> {
    title: String,
    operation_id: Uuid,
    steps: Vec<Box<dyn RevertibleStep + 'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            operation_id: Uuid::new_v4(),
            steps: Vec::new(),
        }
    }

    pub fn with_operation_id(mut self, operation_id: Uuid) -> Self {
        self.operation_id = operation_id;
        self
    }

    pub fn task<T: Send + 'a>(self, task: Task<'a, T>) -> Self {
        self.step(Box::new(task))
    }

    pub fn step(mut self, step: Box<dyn RevertibleStep + 'a>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step; on failure, revert completed steps in reverse order
    pub async fn run(mut self) -> ControlResult<PipelineReport> {
        let operation_id = self.operation_id.to_string();
        let mut completed = Vec::with_capacity(self.steps.len());

        for idx in 0..self.steps.len() {
            let title = self.steps[idx].title().to_string();
            log_task_step(&operation_id, &title, "started", Some(self.title.as_str()));

            if let Err(e) = self.steps[idx].run().await {
                let details = e.to_string();
                log_task_step(&operation_id, &title, "failed", Some(&details));
                error!(
                    operation_id = %operation_id,
                    pipeline = %self.title,
                    step = %title,
                    error = %e,
                    reverting = idx,
                    "pipeline step failed"
                );
                self.revert_completed(idx, &operation_id).await;
                return Err(e);
            }

            log_task_step(&operation_id, &title, "completed", None);
            completed.push(title);
        }

        Ok(PipelineReport {
            operation_id: self.operation_id,
            completed,
        })
    }

    async fn revert_completed(&mut self, failed: usize, operation_id: &str) {
        for step in self.steps[..failed].iter_mut().rev() {
            let title = step.title().to_string();
            log_task_step(operation_id, &title, "reverting", None);
            if let Err(e) = step.revert().await {
                warn!(
                    operation_id = %operation_id,
                    step = %title,
                    error = %e,
                    "revert failed, continuing with earlier steps"
                );
            }
        }
    }
}
