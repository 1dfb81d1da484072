//! # External Process Runner
//!
//! Runs PostgreSQL and satellite programs (`initdb`, `pg_ctl`, `pg_isready`,
//! the HA coordinator) as argument vectors, never through a shell. Output
//! streams are read concurrently and echoed to debug logs line by line.

use crate::error::{ControlError, ControlResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What to run and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting ours
    pub clear_env: bool,
    /// Written to stdin, which is then closed
    pub input: Option<String>,
    /// Collect stdout and stderr into the output
    pub capture_output: bool,
    /// Fail with [`ControlError::Command`] on non-zero exit
    pub check: bool,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            clear_env: false,
            input: None,
            capture_output: true,
            check: true,
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// Program file name without its directory
    pub fn program_name(&self) -> &str {
        Path::new(self.program())
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_else(|| self.program())
    }
}

/// Exit status and captured streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Process execution seam, replaced by a scripted runner in tests
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion
    async fn run(&self, spec: &CommandSpec) -> ControlResult<CommandOutput>;

    /// Start a long-running process in its own process group and return its pid.
    /// Output goes to `log_file` when given, otherwise it is discarded.
    async fn spawn_detached(&self, spec: &CommandSpec, log_file: Option<&Path>) -> ControlResult<u32>;
}

/// Runner backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    fn build_command(spec: &CommandSpec) -> ControlResult<Command> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(ControlError::system("empty command"));
        };
        debug!("Spawning command: {} {:?}", program, args);

        let mut cmd = Command::new(program);
        cmd.args(args);
        if spec.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }

    /// Read a stream line by line, logging each line and collecting it when asked
    fn spawn_capture_task(
        stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
        program: String,
        stream_name: &'static str,
    ) -> JoinHandle<String> {
        tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stream) = stream {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "pgcontrol::command", "{program} [{stream_name}]: {line}");
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        })
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> ControlResult<CommandOutput> {
        let mut cmd = Self::build_command(spec)?;
        let output_stdio = || {
            if spec.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        cmd.stdin(if spec.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(output_stdio())
        .stderr(output_stdio());

        let program = spec.program_name().to_string();
        let mut child = cmd
            .spawn()
            .map_err(|e| ControlError::io(spec.program(), e))?;
        debug!("Command spawned with PID {:?}", child.id());

        let stdin_task = match (child.stdin.take(), spec.input.clone()) {
            (Some(mut stdin), Some(input)) => Some(tokio::spawn(async move {
                // Dropping stdin afterwards closes the pipe
                stdin.write_all(input.as_bytes()).await
            })),
            _ => None,
        };
        let stdout_task = Self::spawn_capture_task(child.stdout.take(), program.clone(), "stdout");
        let stderr_task = Self::spawn_capture_task(child.stderr.take(), program.clone(), "stderr");

        let status = child
            .wait()
            .await
            .map_err(|e| ControlError::io(spec.program(), e))?;

        if let Some(task) = stdin_task {
            match task.await {
                Ok(Err(e)) => warn!(program = %program, error = %e, "failed to write command input"),
                Err(e) => warn!(program = %program, error = %e, "stdin writer task failed"),
                Ok(Ok(())) => {}
            }
        }
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        // Killed by a signal: no exit code
        let returncode = status.code().unwrap_or(-1);
        if spec.check && returncode != 0 {
            return Err(ControlError::Command {
                code: returncode,
                argv: spec.argv.clone(),
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            returncode,
            stdout,
            stderr,
        })
    }

    async fn spawn_detached(&self, spec: &CommandSpec, log_file: Option<&Path>) -> ControlResult<u32> {
        let mut cmd = Self::build_command(spec)?;
        let (stdout, stderr) = match log_file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| ControlError::io(path, e))?;
                let clone = file.try_clone().map_err(|e| ControlError::io(path, e))?;
                (Stdio::from(file), Stdio::from(clone))
            }
            None => (Stdio::null(), Stdio::null()),
        };
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

        // Own process group so the child outlives signals sent to ours
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ControlError::io(spec.program(), e))?;
        let pid = child
            .id()
            .ok_or_else(|| ControlError::system(format!("{} exited immediately", spec.program_name())))?;
        debug!(program = spec.program_name(), pid, "Detached process started");
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() {
        let output = SystemProcessRunner
            .run(&CommandSpec::new(["sh", "-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        assert_eq!(output.returncode, 0);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_check_raises_command_error() {
        let err = SystemProcessRunner
            .run(&CommandSpec::new(["sh", "-c", "echo nope >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            ControlError::Command { code, stderr, argv, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "nope\n");
                assert_eq!(argv[0], "sh");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unchecked_returns_code() {
        let output = SystemProcessRunner
            .run(&CommandSpec::new(["sh", "-c", "exit 2"]).check(false))
            .await
            .unwrap();
        assert_eq!(output.returncode, 2);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_input_and_env() {
        let spec = CommandSpec::new(["sh", "-c", "read line; echo \"$GREETING $line\""])
            .env("GREETING", "hello")
            .input("world\n");
        let output = SystemProcessRunner.run(&spec).await.unwrap();
        assert_eq!(output.stdout, "hello world\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let err = SystemProcessRunner
            .run(&CommandSpec::new(["/nonexistent/pgcontrol-test-binary"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Io { .. }));
    }

    #[test]
    fn test_program_name() {
        let spec = CommandSpec::new(["/usr/lib/postgresql/16/bin/pg_ctl", "status"]);
        assert_eq!(spec.program_name(), "pg_ctl");
    }
}
