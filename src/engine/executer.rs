use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::error::SandboxError;
use crate::core::outcome::StepResult;
use crate::sandbox::{IsolationHandle, OutputCapture, StepCommand, StepStatus};

/// How long a killed step may take to be reaped
const KILL_GRACE: Duration = Duration::from_secs(1);

/// How long output still buffered after the step ends is collected
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Run one step to completion or until its time limit expires.
///
/// Only the process races the timer. Output is consumed while waiting, and
/// once the process has exited its status stands: whatever output is still in
/// flight gets a short grace, so a pipe held open by something else cannot
/// turn a finished step into a timeout. On expiry the step is killed before
/// anything is reported, so nothing keeps running once this returns.
pub async fn run_step(
    handle: &mut dyn IsolationHandle,
    step: &StepCommand,
    max_output_bytes: usize,
) -> Result<StepResult, SandboxError> {
    let started = Instant::now();
    handle.start(step).await?;
    let mut stream = handle.attach_output()?;
    let mut capture = OutputCapture::new(max_output_bytes);

    let limit = tokio::time::sleep(step.time_limit);
    tokio::pin!(limit);
    let finished = {
        let wait = handle.wait();
        tokio::pin!(wait);
        let mut open = true;
        loop {
            tokio::select! {
                biased;
                status = &mut wait => break Some(status),
                _ = &mut limit => break None,
                chunk = stream.recv(), if open => match chunk {
                    Some(chunk) => capture.push(chunk),
                    None => open = false,
                },
            }
        }
    };

    let (status, timed_out) = match finished {
        Some(status) => {
            let status = status?;
            if tokio::time::timeout(DRAIN_GRACE, capture.consume(&mut stream))
                .await
                .is_err()
            {
                debug!(phase = %step.phase, "output still open after exit, dropping the rest");
            }
            (status, false)
        }
        None => {
            debug!(phase = %step.phase, limit_ms = step.time_limit.as_millis() as u64, "time limit reached, killing");
            if let Err(e) = handle.kill().await {
                warn!(phase = %step.phase, error = %e, "kill failed");
            }
            match tokio::time::timeout(KILL_GRACE, handle.wait()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(phase = %step.phase, error = %e, "failed to reap killed step"),
                Err(_) => warn!(phase = %step.phase, "killed step not reaped within grace period"),
            }
            let _ = tokio::time::timeout(DRAIN_GRACE, capture.consume(&mut stream)).await;
            (StepStatus::Killed, true)
        }
    };

    let elapsed = started.elapsed();
    if capture.is_truncated() {
        debug!(phase = %step.phase, "output truncated at {} bytes", max_output_bytes);
    }
    debug!(
        phase = %step.phase,
        ?status,
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "step finished"
    );

    Ok(StepResult {
        phase: step.phase,
        status,
        output: capture.finish(),
        timed_out,
        elapsed,
    })
}
