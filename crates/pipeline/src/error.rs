use framepipe_core::error::CoreError;
use framepipe_core::stages::StageName;

/// Errors surfaced by pipeline execution and its stores.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The stage ran and failed, or produced no usable output.
    #[error("Stage '{stage}' failed: {reason}")]
    StageFailed { stage: StageName, reason: String },

    #[error("Stage '{stage}' timed out after {elapsed_secs}s")]
    Timeout { stage: StageName, elapsed_secs: u64 },

    /// The stage failed too often; the job has been abandoned.
    #[error("Stage '{stage}' abandoned after {attempts} failed attempts: {last_error}")]
    RetriesExhausted {
        stage: StageName,
        attempts: u32,
        last_error: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// The stage the error belongs to, if any.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::StageFailed { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::RetriesExhausted { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether resubmitting the same job can succeed.
    ///
    /// Stage failures and timeouts resume from the checkpoint; an abandoned
    /// job or a rejected request cannot.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::RetriesExhausted { .. })
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) | CoreError::InvalidTransition(msg) => Self::Validation(msg),
            CoreError::Internal(msg) => Self::Storage(std::io::Error::other(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_message_names_stage() {
        let err = PipelineError::StageFailed {
            stage: StageName::SuperResolution,
            reason: "exit code 1".into(),
        };
        assert!(err.to_string().contains("super_resolution"));
        assert_eq!(err.stage(), Some(StageName::SuperResolution));
        assert!(err.is_resumable());
    }

    #[test]
    fn abandoned_job_is_not_resumable() {
        let err = PipelineError::RetriesExhausted {
            stage: StageName::Denoising,
            attempts: 3,
            last_error: "boom".into(),
        };
        assert!(!err.is_resumable());
        assert_eq!(err.stage(), Some(StageName::Denoising));
    }

    #[test]
    fn storage_errors_have_no_stage() {
        let err = PipelineError::from(std::io::Error::other("disk full"));
        assert_eq!(err.stage(), None);
    }
}
