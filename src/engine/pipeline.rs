use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ServiceConfig, StderrPolicy};
use crate::core::error::SandboxError;
use crate::core::outcome::ExecutionOutcome;
use crate::core::request::ExecutionRequest;
use crate::engine::executer::run_step;
use crate::sandbox::{IsolationBackend, IsolationHandle, Phase, ResourceLimits, StepCommand};
use crate::workspace::{Workspace, STDIN_FILE};

/// Extra lifetime granted to an environment beyond its step budgets
const LIFETIME_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    Compiling,
    Running,
    Finished,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Compiling => "compiling",
            PipelineState::Running => "running",
            PipelineState::Finished => "finished",
        };
        write!(f, "{}", s)
    }
}

/// Per-service knobs the pipeline needs
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workspace_root: PathBuf,
    pub compile_timeout: Duration,
    pub max_output_bytes: usize,
    pub stderr_policy: StderrPolicy,
    pub limits: ResourceLimits,
}

impl PipelineSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            compile_timeout: config.compile_timeout,
            max_output_bytes: config.max_output_bytes,
            stderr_policy: config.stderr_policy,
            limits: ResourceLimits {
                memory_mb: config.memory_mb,
                cpu_shares: config.cpu_shares,
                pids: config.pids_limit,
                ..ResourceLimits::default()
            },
        }
    }
}

pub struct Pipeline {
    backend: Arc<dyn IsolationBackend>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn IsolationBackend>, settings: PipelineSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Execute one request end to end.
    ///
    /// The isolation handle and the workspace are torn down before this
    /// returns, whatever the result.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, SandboxError> {
        let workspace = Workspace::create(
            &self.settings.workspace_root,
            &request.language,
            &request.source,
            request.stdin.as_deref(),
        )
        .map_err(SandboxError::Workspace)?;

        let limits = ResourceLimits {
            lifetime: self.settings.compile_timeout + request.timeout + LIFETIME_SLACK,
            ..self.settings.limits.clone()
        };

        let result = match self.backend.acquire(&workspace, &limits).await {
            Ok(mut handle) => {
                let result = self.run_steps(handle.as_mut(), request).await;
                handle.destroy().await;
                result
            }
            Err(e) => Err(e),
        };

        workspace.destroy();
        result
    }

    async fn run_steps(
        &self,
        handle: &mut dyn IsolationHandle,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let language = &request.language;
        let mut state = PipelineState::Idle;

        if let Some(compile) = &language.compile_command {
            state = transition(state, PipelineState::Compiling);
            let step = StepCommand::new(Phase::Compile, compile, self.settings.compile_timeout);
            let result = run_step(handle, &step, self.settings.max_output_bytes).await?;

            if let Some(outcome) = ExecutionOutcome::from_compile(&result) {
                transition(state, PipelineState::Finished);
                info!(language = %language.name, outcome = %outcome, "compile step ended the run");
                return Ok(outcome);
            }
        }

        state = transition(state, PipelineState::Running);
        let step = StepCommand::new(Phase::Run, &language.run_command, request.timeout)
            .with_stdin_file(STDIN_FILE);
        let result = run_step(handle, &step, self.settings.max_output_bytes).await?;
        let elapsed = result.elapsed;

        let outcome = ExecutionOutcome::from_run(result, self.settings.stderr_policy);
        transition(state, PipelineState::Finished);
        info!(
            language = %language.name,
            outcome = %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "execution finished"
        );
        Ok(outcome)
    }
}

fn transition(from: PipelineState, to: PipelineState) -> PipelineState {
    debug!("pipeline {} -> {}", from, to);
    to
}
