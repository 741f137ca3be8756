//! Spawn a stage process, capture its output and enforce the timeout.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::{Invocation, InvocationError, InvocationOutput};

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Output exceeding this limit is truncated so a verbose stage cannot
/// exhaust memory.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Run `invocation` to completion or until its timeout fires.
///
/// A non-zero exit is reported through [`InvocationOutput::exit_code`], not
/// as an error. On timeout the child is killed and
/// [`InvocationError::Timeout`] is returned.
pub async fn run_command(invocation: &Invocation) -> Result<InvocationOutput, InvocationError> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Kills the child when it is dropped on timeout.
        .kill_on_drop(true);

    for (key, value) in &invocation.env_vars {
        cmd.env(key, value);
    }

    if let Some(dir) = &invocation.working_directory {
        cmd.current_dir(dir);
    }

    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => InvocationError::NotFound(invocation.program.clone()),
        _ => InvocationError::Io(e),
    })?;

    // Read the pipes in separate tasks so `child.wait()` can borrow `child`.
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
    let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

    match tokio::time::timeout(invocation.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let stdout_bytes = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();

            Ok(InvocationOutput {
                stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
                exit_code: status.code().unwrap_or(-1),
                duration_ms,
            })
        }
        Ok(Err(e)) => Err(InvocationError::Io(e)),
        Err(_elapsed) => {
            // Make sure the process is gone before reporting.
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(InvocationError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}
