//! A process runner that imitates the PostgreSQL programs.

use async_trait::async_trait;
use parking_lot::Mutex;
use pgcontrol_core::error::{ControlError, ControlResult};
use pgcontrol_core::orchestration::{CommandOutput, CommandSpec, ProcessRunner};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Records every command and keeps a fake server's running flag.
///
/// `initdb` and `pg_basebackup` create a data directory with `PG_VERSION`,
/// `pg_ctl start`/`stop` toggle the flag that `pg_ctl status` reports and
/// `pg_isready` always answers. Any command can be made to fail with
/// [`ScriptedRunner::fail`].
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    running: AtomicBool,
    failures: Mutex<HashMap<String, i32>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `command` (`"initdb"`, `"pg_ctl start"`...) exit with `code`
    pub fn fail(&self, command: &str, code: i32) {
        self.failures.lock().insert(command.to_string(), code);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == command).count()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    async fn simulate(&self, command: &str, spec: &CommandSpec) -> ControlResult<i32> {
        match command {
            "initdb" | "pg_basebackup" => {
                let datadir = option_value(spec, "--pgdata")
                    .ok_or_else(|| ControlError::system("no --pgdata argument"))?;
                tokio::fs::create_dir_all(&datadir)
                    .await
                    .map_err(|e| ControlError::io(&datadir, e))?;
                let version = datadir.join("PG_VERSION");
                tokio::fs::write(&version, "16\n")
                    .await
                    .map_err(|e| ControlError::io(&version, e))?;
                Ok(0)
            }
            "pg_ctl status" => Ok(if self.is_running() { 0 } else { 3 }),
            "pg_ctl start" => {
                self.set_running(true);
                Ok(0)
            }
            "pg_ctl stop" => {
                self.set_running(false);
                Ok(0)
            }
            _ => Ok(0),
        }
    }
}

fn command_key(spec: &CommandSpec) -> String {
    match spec.program_name() {
        "pg_ctl" => format!("pg_ctl {}", spec.argv.get(1).map(String::as_str).unwrap_or("")),
        other => other.to_string(),
    }
}

fn option_value(spec: &CommandSpec, option: &str) -> Option<PathBuf> {
    let position = spec.argv.iter().position(|arg| arg == option)?;
    spec.argv.get(position + 1).map(PathBuf::from)
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> ControlResult<CommandOutput> {
        let command = command_key(spec);
        self.calls.lock().push(command.clone());
        let scripted = self.failures.lock().get(&command).copied();
        let returncode = match scripted {
            Some(code) => code,
            None => self.simulate(&command, spec).await?,
        };
        if spec.check && returncode != 0 {
            return Err(ControlError::Command {
                code: returncode,
                argv: spec.argv.clone(),
                stdout: String::new(),
                stderr: format!("{command} failed"),
            });
        }
        Ok(CommandOutput {
            returncode,
            ..CommandOutput::default()
        })
    }

    async fn spawn_detached(&self, spec: &CommandSpec, _log_file: Option<&Path>) -> ControlResult<u32> {
        self.calls.lock().push(command_key(spec));
        Ok(4242)
    }
}
