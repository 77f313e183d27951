use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Output from a subprocess execution.
#[derive(Debug, Clone, Default)]
pub struct SubprocessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl SubprocessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Run a shell command with a timeout and cooperative cancellation.
///
/// Cancellation and timeout both kill the process group leader; whatever
/// output had been produced by then is returned.
pub async fn run_cmd(
    cmd: &str,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<SubprocessOutput> {
    tracing::debug!(cmd, cwd = %cwd.display(), ?timeout, "spawning subprocess");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        // Allow an agent CLI subprocess to run inside a parent agent session.
        .env_remove("CLAUDECODE")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn: {cmd}"))?;

    let mut stdout_pipe = child.stdout.take().context("failed to capture stdout")?;
    let mut stderr_pipe = child.stderr.take().context("failed to capture stderr")?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let (exit_code, timed_out, cancelled) = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(cmd, "subprocess cancelled, killing");
            let _ = child.kill().await;
            (-1, false, true)
        }
        result = tokio::time::timeout(timeout, child.wait()) => match result {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false, false),
            Ok(Err(e)) => return Err(e).with_context(|| format!("subprocess failed: {cmd}")),
            Err(_) => {
                tracing::warn!(cmd, ?timeout, "subprocess timed out, killing");
                let _ = child.kill().await;
                (-1, true, false)
            }
        }
    };

    // The pipes close once the process is gone, so these finish promptly
    // even on the kill paths.
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let output = SubprocessOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        timed_out,
        cancelled,
    };
    tracing::debug!(
        exit_code = output.exit_code,
        stdout_len = output.stdout.len(),
        timed_out,
        cancelled,
        "subprocess completed"
    );
    Ok(output)
}
