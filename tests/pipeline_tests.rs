mod common;

use async_trait::async_trait;
use common::strategies::pipeline_failure_strategy;
use futures::FutureExt;
use parking_lot::Mutex;
use pgcontrol_core::error::{ControlError, ControlResult, ErrorKind};
use pgcontrol_core::orchestration::{Pipeline, RevertibleStep, Task};
use proptest::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

/// Step written against the trait directly, counting its calls
struct Marker<'a> {
    name: &'static str,
    log: &'a Mutex<Vec<String>>,
    fail_revert: bool,
}

#[async_trait]
impl RevertibleStep for Marker<'_> {
    fn title(&self) -> &str {
        self.name
    }

    async fn run(&mut self) -> ControlResult<()> {
        self.log.lock().push(format!("run {}", self.name));
        Ok(())
    }

    async fn revert(&mut self) -> ControlResult<()> {
        self.log.lock().push(format!("revert {}", self.name));
        if self.fail_revert {
            return Err(ControlError::system("cannot revert"));
        }
        Ok(())
    }
}

fn command_failure() -> ControlError {
    ControlError::Command {
        code: 1,
        argv: vec!["initdb".to_string()],
        stdout: String::new(),
        stderr: "initdb: error".to_string(),
    }
}

#[tokio::test]
async fn test_files_created_by_completed_steps_are_removed() {
    let dir = TempDir::new().unwrap();
    let datadir = dir.path().join("data");
    let later_ran = AtomicBool::new(false);
    let (datadir_ref, later_ref) = (&datadir, &later_ran);

    let err = Pipeline::new("creating instance")
        .task(
            Task::new("allocating", move || {
                async move {
                    tokio::fs::create_dir_all(datadir_ref)
                        .await
                        .map_err(|e| ControlError::io(datadir_ref, e))
                }
                .boxed()
            })
            .with_revert(move |()| {
                async move {
                    tokio::fs::remove_dir_all(datadir_ref)
                        .await
                        .map_err(|e| ControlError::io(datadir_ref, e))
                }
                .boxed()
            }),
        )
        .task(
            Task::new("writing version", move || {
                async move {
                    let path = datadir_ref.join("PG_VERSION");
                    tokio::fs::write(&path, "16\n")
                        .await
                        .map_err(|e| ControlError::io(&path, e))?;
                    Ok::<PathBuf, ControlError>(path)
                }
                .boxed()
            })
            .with_revert(|path: PathBuf| {
                async move {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| ControlError::io(&path, e))
                }
                .boxed()
            }),
        )
        .task(Task::new("initializing", || {
            async { Err::<(), _>(command_failure()) }.boxed()
        }))
        .task(Task::new("starting", move || {
            async move {
                later_ref.store(true, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CommandFailure);
    assert!(!later_ran.load(Ordering::SeqCst));
    assert!(!datadir.exists());
}

#[tokio::test]
async fn test_revert_failure_does_not_replace_original_error() {
    let log = Mutex::new(Vec::new());
    let err = Pipeline::new("test")
        .step(Box::new(Marker {
            name: "first",
            log: &log,
            fail_revert: false,
        }))
        .step(Box::new(Marker {
            name: "second",
            log: &log,
            fail_revert: true,
        }))
        .task(Task::new("third", || async { Err::<(), _>(command_failure()) }.boxed()))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Command { code: 1, .. }));
    assert_eq!(
        *log.lock(),
        vec!["run first", "run second", "revert second", "revert first"]
    );
}

#[tokio::test]
async fn test_first_step_failure_reverts_nothing() {
    let log = Mutex::new(Vec::new());
    let pipeline = Pipeline::new("test")
        .task(Task::new("broken", || {
            async { Err::<(), _>(ControlError::system("boom")) }.boxed()
        }))
        .step(Box::new(Marker {
            name: "never",
            log: &log,
            fail_revert: false,
        }));
    assert_eq!(pipeline.len(), 2);
    let err = pipeline.run().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::System);
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_report_carries_operation_id() {
    let operation_id = uuid::Uuid::new_v4();
    let report = Pipeline::new("test")
        .with_operation_id(operation_id)
        .task(Task::new("only", || async { Ok(()) }.boxed()))
        .run()
        .await
        .unwrap();
    assert_eq!(report.operation_id, operation_id);
    assert_eq!(report.completed, vec!["only"]);
}

/// Run `steps` logging tasks where step `failing` returns an error
fn run_failing_pipeline(steps: usize, failing: usize) -> (Vec<String>, ControlResult<()>) {
    let log = Mutex::new(Vec::new());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let result = runtime.block_on(async {
        let log = &log;
        let mut pipeline = Pipeline::new("generated");
        for step in 1..=steps {
            pipeline = pipeline.task(
                Task::new(format!("step {step}"), move || {
                    async move {
                        log.lock().push(format!("run {step}"));
                        if step == failing {
                            Err(command_failure())
                        } else {
                            Ok(step)
                        }
                    }
                    .boxed()
                })
                .with_revert(move |done| {
                    async move {
                        log.lock().push(format!("revert {done}"));
                        Ok(())
                    }
                    .boxed()
                }),
            );
        }
        pipeline.run().await.map(|_| ())
    });
    (log.into_inner(), result)
}

proptest! {
    /// Property: a failing step leaves every earlier step reverted once, newest first
    #[test]
    fn failing_pipeline_reverts_completed_steps((steps, failing) in pipeline_failure_strategy()) {
        let (log, result) = run_failing_pipeline(steps, failing);

        let err = result.unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::CommandFailure);
        let mut expected: Vec<String> = (1..=failing).map(|step| format!("run {step}")).collect();
        expected.extend((1..failing).rev().map(|step| format!("revert {step}")));
        prop_assert_eq!(log, expected);
    }
}
