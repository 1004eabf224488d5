//! External command execution
//!
//! Every platform driver talks to its cluster through a CLI (`docker`,
//! `kubectl`, `nomad`). Commands go through a [`CommandRunner`] so tests can
//! substitute scripted output, and through a [`CliExecutor`] which adds a
//! per-command timeout, bounded retries and metrics.

use crate::observability::BenchMetrics;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt carried in errors and logs
const STDERR_SNIPPET_CHARS: usize = 400;

/// A command line to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Data piped to the child's stdin
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Space-joined command line, used in logs and for matching in tests
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a completed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` exited with code {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Spawn { .. } => "spawn",
            CommandError::Timeout { .. } => "timeout",
            CommandError::NonZeroExit { .. } => "exit",
        }
    }

    /// Missing binaries will not appear on a second attempt
    fn is_retryable(&self) -> bool {
        !matches!(self, CommandError::Spawn { .. })
    }
}

/// Executes processes on behalf of the drivers
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, killing the process if `timeout` elapses
    async fn run(&self, spec: &CommandSpec, timeout: Duration)
        -> Result<CommandOutput, CommandError>;

    /// Start a process without waiting for it
    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<(), CommandError>;
}

/// Runs real processes with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: spec.display(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (spec.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|source| CommandError::Spawn {
                    command: spec.display(),
                    source,
                })?;
            // Closing stdin lets readers like `nomad job run -` proceed
            drop(pipe);
        }

        // Dropping the child on timeout kills it (kill_on_drop)
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(CommandError::Spawn {
                command: spec.display(),
                source,
            }),
            Err(_) => Err(CommandError::Timeout {
                command: spec.display(),
                timeout,
            }),
        }
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<(), CommandError> {
        Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_child| ())
            .map_err(|source| CommandError::Spawn {
                command: spec.display(),
                source,
            })
    }
}

/// Retry and timeout policy for CLI invocations
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Per-invocation timeout
    pub timeout: Duration,
    /// Total attempts for idempotent commands (1 disables retries)
    pub max_attempts: u32,
    /// Delay before the first retry, doubled per attempt
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Timeout and retry wrapper around a [`CommandRunner`]
#[derive(Clone)]
pub struct CliExecutor {
    runner: Arc<dyn CommandRunner>,
    config: ExecConfig,
    metrics: BenchMetrics,
}

impl CliExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ExecConfig) -> Self {
        Self {
            runner,
            config,
            metrics: BenchMetrics::new(),
        }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Run an idempotent command, retrying timeouts and non-zero exits
    pub async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        self.run_with_timeout(spec, self.config.timeout).await
    }

    /// Like [`run`](Self::run) with a command-specific timeout
    pub async fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.invoke(spec, timeout).await {
                Ok(stdout) => return Ok(stdout),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    debug!(
                        command = %spec.display(),
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Command failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.config.max_backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a command exactly once; used for non-idempotent operations
    pub async fn run_once(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        self.invoke(spec, self.config.timeout).await
    }

    /// Run with retries and swallow the failure into `None` after logging it
    pub async fn output(&self, spec: &CommandSpec) -> Option<String> {
        match self.run(spec).await {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                warn!(command = %spec.display(), error = %e, "Command failed");
                None
            }
        }
    }

    /// Run with retries and report only whether the command was accepted
    pub async fn succeeded(&self, spec: &CommandSpec) -> bool {
        self.output(spec).await.is_some()
    }

    pub async fn spawn_detached(&self, spec: &CommandSpec) -> Result<(), CommandError> {
        self.metrics.inc_cli_invocations(&spec.program);
        debug!(command = %spec.display(), "Spawning detached command");
        self.runner.spawn_detached(spec).await.inspect_err(|e| {
            self.metrics.inc_cli_failures(&spec.program, e.kind());
        })
    }

    async fn invoke(&self, spec: &CommandSpec, timeout: Duration) -> Result<String, CommandError> {
        self.metrics.inc_cli_invocations(&spec.program);
        debug!(command = %spec.display(), "Running command");

        let result = match self.runner.run(spec, timeout).await {
            Ok(output) if output.success() => Ok(output.stdout),
            Ok(output) => Err(CommandError::NonZeroExit {
                command: spec.display(),
                code: output.code,
                stderr: snippet(output.stderr.trim(), STDERR_SNIPPET_CHARS),
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.metrics.inc_cli_failures(&spec.program, e.kind());
        }
        result
    }
}

/// Truncate `text` to at most `max_chars` characters
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
