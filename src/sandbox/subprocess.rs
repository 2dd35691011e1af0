//! Subprocess isolation backend
//!
//! Runs each step as a child process rooted at the workspace directory, in its
//! own process group, with a cleared environment and rlimits applied before
//! exec. The child is a [`reaper`](super::reaper) that owns every process the
//! step creates, so teardown reaches descendants that left the group. There is
//! no container: isolation is limited to what the OS process model provides.
//! Memory, CPU share and pid limits are not applied.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::output::{output_channel, OutputChunk, OutputSink, OutputStream, StreamKind};
use super::reaper::{self, TEARDOWN_SIGNAL};
use super::{IsolationBackend, IsolationHandle, ResourceLimits, StepCommand, StepStatus};
use crate::core::error::SandboxError;
use crate::workspace::Workspace;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const READ_BUFFER: usize = 8192;

/// How long the reaper gets to sweep during teardown before the group is killed
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Backend that runs steps as plain child processes
#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    /// PATH exported to steps (the rest of the environment is cleared)
    path_env: String,
}

impl SubprocessBackend {
    pub fn new() -> Self {
        Self {
            path_env: DEFAULT_PATH.to_string(),
        }
    }

    pub fn with_path_env(mut self, path_env: impl Into<String>) -> Self {
        self.path_env = path_env.into();
        self
    }
}

impl Default for SubprocessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolationBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn acquire(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolationHandle>, SandboxError> {
        Ok(Box::new(SubprocessHandle {
            work_dir: workspace.path().to_path_buf(),
            path_env: self.path_env.clone(),
            file_size_bytes: limits.file_size_bytes,
            child: None,
            reaper: None,
            output: None,
            killed: false,
        }))
    }
}

struct SubprocessHandle {
    work_dir: PathBuf,
    path_env: String,
    file_size_bytes: u64,
    child: Option<Child>,
    /// Pid of the current step's reaper, also its process group
    reaper: Option<i32>,
    output: Option<OutputStream>,
    killed: bool,
}

impl SubprocessHandle {
    /// Ask the reaper to kill everything the step started and exit
    fn request_teardown(&self) -> Result<(), Errno> {
        match self.reaper {
            Some(pid) => match kill(Pid::from_raw(pid), TEARDOWN_SIGNAL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        }
    }

    /// Last resort when the reaper itself does not exit
    fn kill_group(&mut self) {
        if let Some(pgid) = self.reaper.take() {
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => debug!(pgid, "killed process group"),
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid, error = %e, "failed to kill process group"),
            }
        }
    }

    async fn reap_or_kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = self.request_teardown() {
            warn!(error = %e, "failed to signal reaper");
        }
        match tokio::time::timeout(TEARDOWN_GRACE, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to reap child during teardown"),
            Err(_) => {
                warn!("reaper did not exit within grace period, killing group");
                self.kill_group();
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.reaper = None;
    }
}

#[async_trait]
impl IsolationHandle for SubprocessHandle {
    async fn start(&mut self, step: &StepCommand) -> Result<(), SandboxError> {
        let program = step.program()?;

        // A previous step that was never reaped does not get to linger
        self.reap_or_kill().await;

        let stdin = match &step.stdin_file {
            Some(name) => Stdio::from(std::fs::File::open(self.work_dir.join(name))?),
            None => Stdio::null(),
        };

        let mut cmd = Command::new(program);
        cmd.args(&step.argv[1..])
            .current_dir(&self.work_dir)
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", &self.work_dir)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let cpu_secs = step.time_limit.as_secs() * 2 + 1;
        let fsize = self.file_size_bytes;
        // SAFETY: only async-signal-safe syscalls run between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)?;
                setrlimit(Resource::RLIMIT_FSIZE, fsize, fsize)?;
                reaper::split()
            });
        }

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let (sink, stream) = output_channel();
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, StreamKind::Stdout, sink.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, StreamKind::Stderr, sink);
        }

        debug!(
            phase = %step.phase,
            pid = ?child.id(),
            "spawned {:?} in {}",
            step.argv,
            self.work_dir.display()
        );

        self.reaper = child.id().map(|pid| pid as i32);
        self.child = Some(child);
        self.output = Some(stream);
        self.killed = false;
        Ok(())
    }

    fn attach_output(&mut self) -> Result<OutputStream, SandboxError> {
        if self.child.is_none() {
            return Err(SandboxError::NotStarted);
        }
        self.output.take().ok_or(SandboxError::OutputTaken)
    }

    async fn wait(&mut self) -> Result<StepStatus, SandboxError> {
        let child = self.child.as_mut().ok_or(SandboxError::NotStarted)?;
        // The reaper exits only after every descendant is gone
        let status = child.wait().await?;
        self.child = None;
        self.reaper = None;

        if self.killed {
            return Ok(StepStatus::Killed);
        }
        Ok(match status.code() {
            Some(code) => StepStatus::Exited(code),
            None => StepStatus::Signaled(status.signal().unwrap_or(0)),
        })
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        if self.child.is_none() {
            return Ok(());
        }
        self.killed = true;
        self.request_teardown()
            .map_err(|e| SandboxError::Io(e.into()))
    }

    async fn destroy(mut self: Box<Self>) {
        self.reap_or_kill().await;
    }
}

impl Drop for SubprocessHandle {
    fn drop(&mut self) {
        // The reaper sweeps on its own; tokio reaps the reaper
        if self.child.is_some() {
            let _ = self.request_teardown();
        }
    }
}

/// Copy one pipe into the output channel until EOF or until nobody listens
fn pump<R>(mut reader: R, kind: StreamKind, sink: OutputSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        kind,
                        data: buf[..n].to_vec(),
                    };
                    if sink.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(?kind, error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageConfig;
    use crate::sandbox::{CapturedOutput, OutputCapture, Phase};
    use std::time::{Duration, Instant};

    fn shell() -> LanguageConfig {
        LanguageConfig {
            name: "shell".into(),
            source_file: "Main.sh".into(),
            compile_command: None,
            run_command: vec!["sh".into(), "Main.sh".into()],
        }
    }

    fn run_step() -> StepCommand {
        StepCommand::new(Phase::Run, &shell().run_command, Duration::from_secs(5))
            .with_stdin_file(crate::workspace::STDIN_FILE)
    }

    async fn run_to_end(
        handle: &mut Box<dyn IsolationHandle>,
        step: &StepCommand,
    ) -> (StepStatus, CapturedOutput) {
        handle.start(step).await.unwrap();
        let mut stream = handle.attach_output().unwrap();
        let mut capture = OutputCapture::new(1 << 16);
        let (status, ()) = tokio::join!(handle.wait(), capture.consume(&mut stream));
        (status.unwrap(), capture.finish())
    }

    async fn acquire(root: &tempfile::TempDir, script: &str, stdin: Option<&str>) -> (Workspace, Box<dyn IsolationHandle>) {
        let ws = Workspace::create(root.path(), &shell(), script, stdin).unwrap();
        let handle = SubprocessBackend::new()
            .acquire(&ws, &ResourceLimits::default())
            .await
            .unwrap();
        (ws, handle)
    }

    #[tokio::test]
    async fn test_streams_and_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "echo hi; echo oops >&2; exit 3", None).await;

        let (status, output) = run_to_end(&mut handle, &run_step()).await;

        assert_eq!(status, StepStatus::Exited(3));
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "oops\n");
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_stdin_comes_from_workspace_file() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "read line; echo \"got $line\"", Some("ping\n")).await;

        let (status, output) = run_to_end(&mut handle, &run_step()).await;

        assert!(status.is_success());
        assert_eq!(output.stdout, "got ping\n");
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_runs_in_workspace_with_clean_env() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "pwd; echo \"user=$USER\"", None).await;

        let (_, output) = run_to_end(&mut handle, &run_step()).await;

        let expected = std::fs::canonicalize(ws.path()).unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            expected
        );
        assert_eq!(lines.next(), Some("user="));
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_kill_makes_wait_return_promptly() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "echo started; sleep 30", None).await;

        handle.start(&run_step()).await.unwrap();
        let _stream = handle.attach_output().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        handle.kill().await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("wait hung after kill")
            .unwrap();

        assert_eq!(status, StepStatus::Killed);
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_background_children_do_not_outlive_step() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "sleep 30 & echo detached", None).await;

        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            run_to_end(&mut handle, &run_step()),
        )
        .await
        .expect("output stream held open by a leftover process");

        assert_eq!(finished.0, StepStatus::Exited(0));
        assert_eq!(finished.1.stdout, "detached\n");
        handle.destroy().await;
        ws.destroy();
    }

    fn detached_sleeper(marker: &std::path::Path) -> String {
        format!(
            "setsid sh -c 'echo $$ > {}; exec sleep 30' &",
            marker.display()
        )
    }

    async fn wait_for_marker(marker: &std::path::Path) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while std::fs::metadata(marker).map(|m| m.len() == 0).unwrap_or(true) {
            assert!(Instant::now() < deadline, "detached process never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn is_gone(marker: &std::path::Path) -> bool {
        let pid: i32 = std::fs::read_to_string(marker).unwrap().trim().parse().unwrap();
        matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
    }

    #[tokio::test]
    async fn test_new_session_does_not_outlive_step() {
        let root = tempfile::tempdir().unwrap();
        let marker = root.path().join("escaped.pid");
        let script = format!("{} sleep 0.3; echo done", detached_sleeper(&marker));
        let (ws, mut handle) = acquire(&root, &script, None).await;

        let started = Instant::now();
        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            run_to_end(&mut handle, &run_step()),
        )
        .await
        .expect("output stream held open by a detached process");

        assert_eq!(finished.0, StepStatus::Exited(0));
        assert_eq!(finished.1.stdout, "done\n");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(is_gone(&marker));
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_kill_reaches_new_session() {
        let root = tempfile::tempdir().unwrap();
        let marker = root.path().join("escaped.pid");
        let script = format!("{} sleep 30", detached_sleeper(&marker));
        let (ws, mut handle) = acquire(&root, &script, None).await;

        handle.start(&run_step()).await.unwrap();
        let _stream = handle.attach_output().unwrap();
        wait_for_marker(&marker).await;

        handle.kill().await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("wait hung after kill")
            .unwrap();

        assert_eq!(status, StepStatus::Killed);
        assert!(is_gone(&marker));
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_destroy_without_wait_sweeps_step() {
        let root = tempfile::tempdir().unwrap();
        let marker = root.path().join("escaped.pid");
        let script = format!("{} sleep 30", detached_sleeper(&marker));
        let (ws, mut handle) = acquire(&root, &script, None).await;

        handle.start(&run_step()).await.unwrap();
        wait_for_marker(&marker).await;

        tokio::time::timeout(Duration::from_secs(3), handle.destroy())
            .await
            .expect("teardown hung");

        assert!(is_gone(&marker));
        ws.destroy();
    }

    #[tokio::test]
    async fn test_signal_status_passes_through_reaper() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "kill -USR1 $$", None).await;

        let (status, _) = run_to_end(&mut handle, &run_step()).await;

        assert_eq!(status, StepStatus::Signaled(Signal::SIGUSR1 as i32));
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "", None).await;
        let step = StepCommand::new(
            Phase::Compile,
            &["definitely-not-a-compiler".to_string()],
            Duration::from_secs(1),
        );

        let err = handle.start(&step).await.unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
        assert!(matches!(handle.wait().await, Err(SandboxError::NotStarted)));
        handle.destroy().await;
        ws.destroy();
    }

    #[tokio::test]
    async fn test_output_attaches_once() {
        let root = tempfile::tempdir().unwrap();
        let (ws, mut handle) = acquire(&root, "true", None).await;

        handle.start(&run_step()).await.unwrap();
        assert!(handle.attach_output().is_ok());
        assert!(matches!(handle.attach_output(), Err(SandboxError::OutputTaken)));
        handle.wait().await.unwrap();
        handle.destroy().await;
        ws.destroy();
    }
}
