//! The seam between the executor and whatever performs a stage.
//!
//! [`CommandRunner`] spawns the stage's external command. Tests substitute
//! their own [`StageRunner`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use framepipe_core::invocation::subprocess::run_command;
use framepipe_core::invocation::{Invocation, InvocationError};
use framepipe_core::stages::{CommandTemplate, StageName, StageParams};
use framepipe_core::types::JobId;

/// Number of trailing stderr bytes kept in a failure reason.
const STDERR_TAIL_BYTES: usize = 2048;

/// Everything needed to run one stage once.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: JobId,
    pub stage: StageName,
    pub command: CommandTemplate,
    /// All base inputs for the first stage, otherwise the single forward
    /// artifact.
    pub inputs: Vec<PathBuf>,
    /// Where the stage must write its non-empty output.
    pub output: PathBuf,
    pub params: StageParams,
    pub timeout: Duration,
}

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage reported success. The executor still checks the output.
    Complete,
    Failed { reason: String },
    Timeout { elapsed: Duration },
}

#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, request: &StageRequest) -> StageOutcome;
}

/// Runs stages as external processes.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    /// Extra environment variables passed to every stage process.
    pub env_vars: Vec<(String, String)>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StageRunner for CommandRunner {
    async fn run(&self, request: &StageRequest) -> StageOutcome {
        let args = match request
            .command
            .render(&request.inputs, &request.output, &request.params)
        {
            Ok(args) => args,
            Err(e) => {
                return StageOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let mut invocation = Invocation::new(request.command.program.clone(), args, request.timeout);
        invocation.env_vars = self.env_vars.clone();

        tracing::debug!(
            job_id = %request.job_id,
            stage = %request.stage,
            command = %invocation.display(),
            "Spawning stage process"
        );

        match run_command(&invocation).await {
            Ok(output) if output.success() => StageOutcome::Complete,
            Ok(output) => StageOutcome::Failed {
                reason: format!(
                    "exit code {}: {}",
                    output.exit_code,
                    stderr_tail(&output.stderr)
                ),
            },
            Err(InvocationError::Timeout { elapsed_ms }) => StageOutcome::Timeout {
                elapsed: Duration::from_millis(elapsed_ms),
            },
            Err(e) => StageOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// Last few lines of stderr, where stage scripts print their error.
fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn bash_request(script: &str, output: PathBuf, timeout: Duration) -> StageRequest {
        StageRequest {
            job_id: "job-1".into(),
            stage: StageName::Denoising,
            command: CommandTemplate {
                program: "bash".into(),
                args: vec!["-c".into(), script.into(), "stage".into(), "{output}".into()],
            },
            inputs: vec![PathBuf::from("/dev/null")],
            output,
            params: StageParams::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn successful_process_completes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let request = bash_request("echo data > \"$1\"", output.clone(), Duration::from_secs(5));

        assert_eq!(CommandRunner::new().run(&request).await, StageOutcome::Complete);
        assert!(output.exists());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let request = bash_request(
            "echo 'CUDA out of memory' >&2; exit 3",
            dir.path().join("out.mp4"),
            Duration::from_secs(5),
        );

        assert_matches!(
            CommandRunner::new().run(&request).await,
            StageOutcome::Failed { reason } if reason.contains("exit code 3") && reason.contains("CUDA out of memory")
        );
    }

    #[tokio::test]
    async fn slow_process_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let request = bash_request("sleep 10", dir.path().join("out.mp4"), Duration::from_millis(100));

        assert_matches!(
            CommandRunner::new().run(&request).await,
            StageOutcome::Timeout { .. }
        );
    }

    #[tokio::test]
    async fn missing_parameter_fails_before_spawning() {
        let mut request = bash_request("true", PathBuf::from("/tmp/out"), Duration::from_secs(5));
        request.command.args.push("{param:model}".into());

        assert_matches!(
            CommandRunner::new().run(&request).await,
            StageOutcome::Failed { reason } if reason.contains("model")
        );
    }

    #[test]
    fn stderr_tail_keeps_end() {
        let long = format!("{}END", "x".repeat(STDERR_TAIL_BYTES * 2));
        let tail = stderr_tail(&long);
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
    }
}
