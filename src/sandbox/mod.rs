//! Sandbox module - Isolation backends
//!
//! This module provides a single capability contract over the two ways
//! untrusted code is isolated:
//! - `ContainerBackend`: one Docker container per request (bollard)
//! - `SubprocessBackend`: a child process group with OS limits only
//!
//! The sandbox module does NOT:
//! - Decide timeouts (the executor races the timer and calls `kill`)
//! - Classify outcomes
//! - Know about languages

pub mod container;
pub mod output;
mod reaper;
pub mod subprocess;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::core::error::SandboxError;
use crate::workspace::Workspace;

// Re-exports for convenience
pub use container::ContainerBackend;
pub use output::{CapturedOutput, OutputCapture, OutputStream};
pub use subprocess::SubprocessBackend;

/// Pipeline phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        };
        write!(f, "{}", s)
    }
}

/// One command to execute inside an acquired environment
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub phase: Phase,
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// File in the workspace to use as stdin (`/dev/null` when absent)
    pub stdin_file: Option<String>,
    /// Wall-clock limit enforced by the executor
    pub time_limit: Duration,
}

impl StepCommand {
    pub fn new(phase: Phase, argv: &[String], time_limit: Duration) -> Self {
        Self {
            phase,
            argv: argv.to_vec(),
            stdin_file: None,
            time_limit,
        }
    }

    pub fn with_stdin_file(mut self, name: impl Into<String>) -> Self {
        self.stdin_file = Some(name.into());
        self
    }

    pub fn program(&self) -> Result<&str, SandboxError> {
        self.argv
            .first()
            .map(String::as_str)
            .ok_or_else(|| SandboxError::EmptyCommand(self.phase.to_string()))
    }
}

/// How a step ended (raw, no outcome interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Exited normally with the given code
    Exited(i32),
    /// Terminated by a signal it did not ask for (crash, OOM kill)
    Signaled(i32),
    /// Terminated by `kill` after the time limit
    Killed,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Exited(0))
    }

    /// Shell-style exit code
    pub fn exit_code(&self) -> i32 {
        match *self {
            StepStatus::Exited(code) => code,
            StepStatus::Signaled(sig) => 128 + sig,
            StepStatus::Killed => 137,
        }
    }
}

/// Resource ceiling applied when the environment is acquired
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_shares: i64,
    pub pids: i64,
    /// Largest file a step may write
    pub file_size_bytes: u64,
    /// Upper bound on the environment's lifetime (all steps plus slack)
    pub lifetime: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpu_shares: 256,
            pids: 64,
            file_size_bytes: 64 * 1024 * 1024,
            lifetime: Duration::from_secs(60),
        }
    }
}

/// Obtains isolated execution environments
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short name used in logs and `/health`
    fn name(&self) -> &'static str;

    /// Create an environment and stage the workspace files into it
    async fn acquire(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolationHandle>, SandboxError>;
}

/// An acquired environment, exclusively owned by one pipeline run
#[async_trait]
pub trait IsolationHandle: Send {
    /// Launch a step. The previous step, if any, must have been waited for.
    async fn start(&mut self, step: &StepCommand) -> Result<(), SandboxError>;

    /// Take the current step's output. Once per step.
    fn attach_output(&mut self) -> Result<OutputStream, SandboxError>;

    /// Block until the current step ends. Returns `Killed` promptly after `kill`.
    async fn wait(&mut self) -> Result<StepStatus, SandboxError>;

    /// Forcibly terminate the current step
    async fn kill(&mut self) -> Result<(), SandboxError>;

    /// Tear the environment down. Never fails; problems are logged.
    async fn destroy(self: Box<Self>);
}
