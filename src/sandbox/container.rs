//! Container isolation backend
//!
//! One Docker container per request: created from a prebuilt runtime image with
//! networking disabled and fixed memory/CPU/pid ceilings. The workspace is
//! copied in as a tar archive and every step runs as an exec inside the same
//! container, so compiler output stays available to the run step.

use async_trait::async_trait;
#[allow(deprecated)]
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    RemoveContainerOptionsBuilder, StartContainerOptions as BollardStartContainerOptionsQuery,
    UploadToContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::output::{output_channel, OutputChunk, OutputStream};
use super::{IsolationBackend, IsolationHandle, ResourceLimits, StepCommand, StepStatus};
use crate::core::error::SandboxError;
use crate::workspace::Workspace;

/// Working directory inside the container; workspace files land here
const CONTAINER_WORK_DIR: &str = "/sandbox";

/// How often a running exec is polled for completion
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Backend that runs each request in a fresh Docker container
pub struct ContainerBackend {
    docker: Docker,
    image: String,
}

impl ContainerBackend {
    /// Connect to the local Docker daemon
    pub fn connect(image: impl Into<String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    /// Fail fast when the daemon is unreachable or the runtime image is missing
    pub async fn ensure_ready(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        self.docker.inspect_image(&self.image).await?;
        info!("Docker daemon reachable, runtime image {} present", self.image);
        Ok(())
    }

    async fn create_container(&self, limits: &ResourceLimits) -> Result<String, SandboxError> {
        let memory = (limits.memory_mb * 1024 * 1024) as i64;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("exec-sandbox-{}", Uuid::new_v4())),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(self.image.clone()),
            // Keeps the container alive while steps run as execs
            cmd: Some(vec![
                "sleep".to_string(),
                limits.lifetime.as_secs().max(1).to_string(),
            ]),
            working_dir: Some(CONTAINER_WORK_DIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                memory: Some(memory),
                memory_swap: Some(memory),
                cpu_shares: Some(limits.cpu_shares),
                pids_limit: Some(limits.pids),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        Ok(container.id)
    }

    async fn stage_files(&self, container_id: &str, workspace: &Workspace) -> Result<(), SandboxError> {
        let archive = pack_directory(workspace.path()).map_err(SandboxError::Archive)?;
        let options = UploadToContainerOptionsBuilder::default()
            .path(CONTAINER_WORK_DIR)
            .build();

        self.docker
            .upload_to_container(
                container_id,
                Some(options),
                bollard::body_full(bytes::Bytes::from(archive)),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn acquire(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolationHandle>, SandboxError> {
        let container_id = self.create_container(limits).await?;

        // From here on the handle owns the container and removes it on any failure
        let mut handle = ContainerHandle {
            docker: self.docker.clone(),
            container_id,
            exec_id: None,
            output: None,
            killed: false,
            removed: false,
        };

        let staged = async {
            self.stage_files(&handle.container_id, workspace).await?;
            self.docker
                .start_container(
                    &handle.container_id,
                    None::<BollardStartContainerOptionsQuery>,
                )
                .await?;
            Ok::<(), SandboxError>(())
        }
        .await;

        if let Err(e) = staged {
            handle.remove().await;
            return Err(e);
        }

        debug!(container = %handle.container_id, "container acquired");
        Ok(Box::new(handle))
    }
}

struct ContainerHandle {
    docker: Docker,
    container_id: String,
    exec_id: Option<String>,
    output: Option<OutputStream>,
    killed: bool,
    removed: bool,
}

impl ContainerHandle {
    async fn remove(&mut self) {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self
            .docker
            .remove_container(&self.container_id, Some(options))
            .await
        {
            Ok(()) => debug!(container = %self.container_id, "container removed"),
            Err(e) => warn!(
                container = %self.container_id,
                error = %e,
                "failed to remove container"
            ),
        }
        self.removed = true;
    }
}

#[async_trait]
impl IsolationHandle for ContainerHandle {
    async fn start(&mut self, step: &StepCommand) -> Result<(), SandboxError> {
        step.program()?;

        #[allow(deprecated)]
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(exec_command(step)),
                    working_dir: Some(CONTAINER_WORK_DIR.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        #[allow(deprecated)]
        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?;

        let mut log_stream = match started {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => return Err(SandboxError::Detached),
        };

        // Demultiplex the exec's log stream into attributed chunks
        let (sink, stream) = output_channel();
        let exec_id = exec.id.clone();
        tokio::spawn(async move {
            while let Some(item) = log_stream.next().await {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        OutputChunk::stdout(message.to_vec())
                    }
                    Ok(LogOutput::StdErr { message }) => OutputChunk::stderr(message.to_vec()),
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        debug!(exec = %exec_id, error = %e, "exec log stream ended with error");
                        break;
                    }
                };
                if sink.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        debug!(
            container = %self.container_id,
            exec = %exec.id,
            phase = %step.phase,
            "started {:?}",
            step.argv
        );

        self.exec_id = Some(exec.id);
        self.output = Some(stream);
        self.killed = false;
        Ok(())
    }

    fn attach_output(&mut self) -> Result<OutputStream, SandboxError> {
        if self.exec_id.is_none() {
            return Err(SandboxError::NotStarted);
        }
        self.output.take().ok_or(SandboxError::OutputTaken)
    }

    async fn wait(&mut self) -> Result<StepStatus, SandboxError> {
        let exec_id = self.exec_id.clone().ok_or(SandboxError::NotStarted)?;
        loop {
            if self.killed {
                return Ok(StepStatus::Killed);
            }
            let inspect = self.docker.inspect_exec(&exec_id).await?;
            if inspect.running != Some(true) {
                return Ok(exec_status(inspect.exit_code));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.killed = true;
        match self
            .docker
            .kill_container(
                &self.container_id,
                None::<BollardKillContainerOptionsQuery>,
            )
            .await
        {
            Err(e) if !is_already_stopped(&e) => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn destroy(mut self: Box<Self>) {
        self.remove().await;
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // Owning task was aborted before teardown; remove in the background
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let options = RemoveContainerOptionsBuilder::default().force(true).build();
                    if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                        warn!(container = %container_id, error = %e, "late container removal failed");
                    }
                });
            }
            Err(_) => warn!(container = %container_id, "container leaked: no runtime to remove it"),
        }
    }
}

/// Build the exec argv; stdin comes from the staged file via shell redirection
fn exec_command(step: &StepCommand) -> Vec<String> {
    match &step.stdin_file {
        Some(name) => {
            let mut argv = vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("exec \"$0\" \"$@\" < {}", shell_quote(name)),
            ];
            argv.extend(step.argv.iter().cloned());
            argv
        }
        None => step.argv.clone(),
    }
}

/// Step status from an exec's exit code.
///
/// Docker reports a signal death as 128+n (137 for the OOM killer). An exec
/// that ended without a code is treated as exit -1.
fn exec_status(exit_code: Option<i64>) -> StepStatus {
    let code = exit_code.unwrap_or(-1) as i32;
    if code > 128 {
        StepStatus::Signaled(code - 128)
    } else {
        StepStatus::Exited(code)
    }
}

/// Docker answers 409 when killing a container that is not running
fn is_already_stopped(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Pack the workspace's files into an in-memory tar archive
fn pack_directory(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            builder.append_path_with_name(entry.path(), entry.file_name())?;
        }
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageConfig;
    use crate::sandbox::Phase;

    #[test]
    fn test_exec_command_without_stdin() {
        let step = StepCommand::new(
            Phase::Compile,
            &["javac".to_string(), "Main.java".to_string()],
            Duration::from_secs(10),
        );
        assert_eq!(exec_command(&step), vec!["javac", "Main.java"]);
    }

    #[test]
    fn test_exec_command_redirects_stdin() {
        let step = StepCommand::new(
            Phase::Run,
            &["java".to_string(), "Main".to_string()],
            Duration::from_secs(5),
        )
        .with_stdin_file("input.txt");

        assert_eq!(
            exec_command(&step),
            vec!["sh", "-c", "exec \"$0\" \"$@\" < 'input.txt'", "java", "Main"]
        );
    }

    #[test]
    fn test_exec_status_maps_signal_codes() {
        assert_eq!(exec_status(Some(0)), StepStatus::Exited(0));
        assert_eq!(exec_status(Some(1)), StepStatus::Exited(1));
        assert_eq!(exec_status(Some(128)), StepStatus::Exited(128));
        assert_eq!(exec_status(Some(137)), StepStatus::Signaled(9));
        assert_eq!(exec_status(Some(139)), StepStatus::Signaled(11));
        assert_eq!(exec_status(Some(139)).exit_code(), 139);
        assert_eq!(exec_status(None), StepStatus::Exited(-1));
    }

    #[test]
    fn test_only_conflict_counts_as_already_stopped() {
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "Container abc is not running".into(),
        };
        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        };
        assert!(is_already_stopped(&conflict));
        assert!(!is_already_stopped(&missing));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_pack_directory_contains_workspace_files() {
        let root = tempfile::tempdir().unwrap();
        let java = LanguageConfig {
            name: "java".into(),
            source_file: "Main.java".into(),
            compile_command: None,
            run_command: vec!["java".into(), "Main".into()],
        };
        let ws = Workspace::create(root.path(), &java, "class Main {}", Some("ping")).unwrap();

        let archive = pack_directory(ws.path()).unwrap();
        let mut names: Vec<String> = tar::Archive::new(archive.as_slice())
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();

        assert_eq!(names, vec!["Main.java", "input.txt"]);
        ws.destroy();
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon and the java-sandbox image"]
    async fn test_container_lifecycle() {
        let backend = ContainerBackend::connect("java-sandbox:latest").unwrap();
        backend.ensure_ready().await.unwrap();

        let root = tempfile::tempdir().unwrap();
        let shell = LanguageConfig {
            name: "shell".into(),
            source_file: "Main.sh".into(),
            compile_command: None,
            run_command: vec!["sh".into(), "Main.sh".into()],
        };
        let ws = Workspace::create(root.path(), &shell, "read x; echo \"$x\"; echo e >&2", Some("ping")).unwrap();
        let mut handle = backend.acquire(&ws, &ResourceLimits::default()).await.unwrap();

        let step = StepCommand::new(Phase::Run, &shell.run_command, Duration::from_secs(5))
            .with_stdin_file("input.txt");
        handle.start(&step).await.unwrap();
        let mut stream = handle.attach_output().unwrap();
        let mut capture = crate::sandbox::OutputCapture::new(4096);
        let (status, ()) = tokio::join!(handle.wait(), capture.consume(&mut stream));

        assert_eq!(status.unwrap(), StepStatus::Exited(0));
        let output = capture.finish();
        assert_eq!(output.stdout, "ping\n");
        assert_eq!(output.stderr, "e\n");
        handle.destroy().await;
        ws.destroy();
    }
}
