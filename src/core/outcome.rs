use std::fmt;
use std::time::Duration;

use crate::config::StderrPolicy;
use crate::sandbox::{CapturedOutput, Phase, StepStatus};

/// Raw result of one executed step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub phase: Phase,
    pub status: StepStatus,
    pub output: CapturedOutput,
    /// Set when the wall-clock timer won the race
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Final classification of a request. Produced exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    CompileError {
        stderr: String,
    },
    RuntimeError {
        stdout: String,
        stderr: String,
        exit_code: i32,
        /// Output hit the byte cap and was cut short
        truncated: bool,
    },
    TimedOut {
        partial_output: String,
        phase: Phase,
        truncated: bool,
    },
    Success {
        stdout: String,
        stderr: String,
        exit_code: i32,
        truncated: bool,
    },
}

impl ExecutionOutcome {
    /// Outcome that ends the pipeline after the compile step, if any
    pub fn from_compile(step: &StepResult) -> Option<Self> {
        if step.timed_out {
            return Some(Self::timed_out(step));
        }
        if step.status.is_success() {
            return None;
        }

        let message = if !step.output.stderr.trim().is_empty() {
            step.output.stderr.clone()
        } else if !step.output.stdout.trim().is_empty() {
            step.output.stdout.clone()
        } else {
            describe_status(step.status)
        };
        Some(ExecutionOutcome::CompileError { stderr: message })
    }

    /// Classify the run step
    pub fn from_run(step: StepResult, policy: StderrPolicy) -> Self {
        if step.timed_out {
            return Self::timed_out(&step);
        }

        let CapturedOutput {
            stdout,
            stderr,
            truncated,
            ..
        } = step.output;
        let exit_code = step.status.exit_code();

        let stderr_fails = policy == StderrPolicy::Failure && !stderr.is_empty();
        if stderr_fails || !step.status.is_success() {
            ExecutionOutcome::RuntimeError {
                stdout,
                stderr,
                exit_code,
                truncated,
            }
        } else {
            ExecutionOutcome::Success {
                stdout,
                stderr,
                exit_code,
                truncated,
            }
        }
    }

    fn timed_out(step: &StepResult) -> Self {
        ExecutionOutcome::TimedOut {
            partial_output: step.output.combined.clone(),
            phase: step.phase,
            truncated: step.output.truncated,
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionOutcome::CompileError { .. } => "compile_error",
            ExecutionOutcome::RuntimeError { .. } => "runtime_error",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::Success { .. } => "success",
        };
        write!(f, "{}", s)
    }
}

fn describe_status(status: StepStatus) -> String {
    match status {
        StepStatus::Exited(code) => format!("Compiler exited with code {}", code),
        StepStatus::Signaled(sig) => format!("Compiler terminated by signal {}", sig),
        StepStatus::Killed => "Compiler was killed".to_string(),
    }
}
