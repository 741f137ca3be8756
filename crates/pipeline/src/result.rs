//! Caller-facing result payload.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::executor::JobOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Complete,
    Error,
}

/// `{status, output?, transcription?, cached?, error?}` with absent fields
/// omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    /// Only present (and `true`) for cache hits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultPayload {
    pub fn complete(output: &JobOutput) -> Self {
        Self {
            status: ResultStatus::Complete,
            output: Some(output.artifact_path.display().to_string()),
            transcription: output.transcription().map(|p| p.display().to_string()),
            cached: output.cached.then_some(true),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            output: None,
            transcription: None,
            cached: None,
            error: Some(message.into()),
        }
    }
}

impl From<&Result<JobOutput, PipelineError>> for ResultPayload {
    fn from(result: &Result<JobOutput, PipelineError>) -> Self {
        match result {
            Ok(output) => Self::complete(output),
            Err(e) => Self::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use framepipe_core::stages::StageName;
    use serde_json::json;

    use super::*;

    fn output(cached: bool, transcription: bool) -> JobOutput {
        let mut side_outputs = BTreeMap::new();
        if transcription {
            side_outputs.insert(StageName::SpeechToText, PathBuf::from("/out/j_transcription.txt"));
        }
        JobOutput {
            job_id: "j".into(),
            artifact_path: PathBuf::from("/out/j_output.mp4"),
            side_outputs,
            cached,
            fingerprint: "fp".into(),
        }
    }

    #[test]
    fn fresh_result_omits_absent_fields() {
        let payload = ResultPayload::from(&Ok(output(false, false)));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"status": "Complete", "output": "/out/j_output.mp4"})
        );
    }

    #[test]
    fn cached_result_with_transcription() {
        let payload = ResultPayload::from(&Ok(output(true, true)));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "status": "Complete",
                "output": "/out/j_output.mp4",
                "transcription": "/out/j_transcription.txt",
                "cached": true,
            })
        );
    }

    #[test]
    fn error_result_names_stage() {
        let result: Result<JobOutput, PipelineError> = Err(PipelineError::StageFailed {
            stage: StageName::SuperResolution,
            reason: "exit code 1".into(),
        });
        let value = serde_json::to_value(ResultPayload::from(&result)).unwrap();
        assert_eq!(value["status"], "Error");
        assert!(value["error"].as_str().unwrap().contains("super_resolution"));
        assert!(value.get("output").is_none());
    }
}
