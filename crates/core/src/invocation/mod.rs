//! External stage invocation.
//!
//! Stages are opaque executables. This module describes one invocation
//! ([`Invocation`]), its captured result ([`InvocationOutput`]) and the
//! ways spawning it can fail ([`InvocationError`]). The spawn, capture and
//! timeout logic lives in [`subprocess`].

pub mod subprocess;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A fully rendered command ready to spawn.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Additional environment variables set for the child process.
    pub env_vars: Vec<(String, String)>,
    /// Working directory for the child process (uses current dir if `None`).
    pub working_directory: Option<PathBuf>,
    /// Maximum wall-clock time before the process is killed.
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            env_vars: Vec::new(),
            working_directory: None,
            timeout,
        }
    }

    /// Command line for logging.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output from a finished process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl InvocationOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
