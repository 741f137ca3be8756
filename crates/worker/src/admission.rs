//! Turns a submitted job description into an admitted [`Job`].
//!
//! Admission validates the request, assigns the job id (or keeps the one
//! of a resubmission) and labels the job with its priority class. Queue
//! routing itself happens outside this process.

use std::path::PathBuf;

use framepipe_core::error::CoreError;
use framepipe_core::job::{Job, JobRequest};
use framepipe_core::priority::classify;
use framepipe_core::types::new_job_id;

/// Parse a JSON job description.
pub fn parse_request(json: &str) -> Result<JobRequest, CoreError> {
    serde_json::from_str(json)
        .map_err(|e| CoreError::Validation(format!("malformed job description: {e}")))
}

/// Validate `request` and build the job it describes.
///
/// Every problem found is reported at once in a single
/// [`CoreError::Validation`].
pub fn admit(request: JobRequest, max_file_size_bytes: u64) -> Result<Job, CoreError> {
    let errors = request.validate(max_file_size_bytes);
    if !errors.is_empty() {
        return Err(CoreError::Validation(errors.join("; ")));
    }

    let inputs: Vec<PathBuf> = request.input.iter().map(PathBuf::from).collect();
    let input_bytes = total_size(&inputs)?;
    let optional_stages = request.ai_options.optional_count();
    let priority = classify(input_bytes, optional_stages);

    let resubmitted = request.job_id.is_some();
    let id = request.job_id.unwrap_or_else(new_job_id);

    tracing::info!(
        job_id = %id,
        priority = %priority,
        queue = priority.queue_name(),
        input_bytes,
        optional_stages,
        resubmitted,
        "Job admitted"
    );

    Ok(Job::new(
        id,
        inputs,
        request.fps,
        request.ai_options,
        priority,
    ))
}

fn total_size(inputs: &[PathBuf]) -> Result<u64, CoreError> {
    inputs.iter().try_fold(0u64, |acc, path| {
        let len = std::fs::metadata(path)
            .map_err(|e| CoreError::Validation(format!("{}: {e}", path.display())))?
            .len();
        Ok(acc.saturating_add(len))
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn malformed_json_is_a_validation_error() {
        assert_matches!(parse_request("{\"input\": "), Err(CoreError::Validation(_)));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = parse_request(r#"{"input": ["a.png"], "fps": 24, "ai_options": {"sharpen": true}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("sharpen"));
    }
}
