//! Job model, admission request and job status state machine.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::priority::Priority;
use crate::stages::{StageName, StageParams};
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Image extensions accepted as base-stage inputs.
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff"];

/// Default per-input size limit in megabytes.
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;

/// Default temporal strength passed to the denoiser.
pub const DEFAULT_TEMPORAL_STRENGTH: u32 = 4;

/// Default spatial strength passed to the denoiser.
pub const DEFAULT_SPATIAL_STRENGTH: u32 = 3;

/// Default transcription model.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "base";

// ---------------------------------------------------------------------------
// Optional stage parameters
// ---------------------------------------------------------------------------

/// Sparse optional-stage parameters as submitted.
///
/// `false` and `null` are accepted for every key and mean "not requested".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOptions {
    /// Resolution multiplier such as `"x4"`.
    #[serde(default, deserialize_with = "falsy_as_none", skip_serializing_if = "Option::is_none")]
    pub superres: Option<String>,
    #[serde(default, deserialize_with = "falsy_as_none", skip_serializing_if = "Option::is_none")]
    pub denoise: Option<bool>,
    #[serde(default, deserialize_with = "falsy_as_none", skip_serializing_if = "Option::is_none")]
    pub speech2text: Option<bool>,
    /// Target frame rate for interpolation.
    #[serde(default, deserialize_with = "falsy_as_none", skip_serializing_if = "Option::is_none")]
    pub framerateboost: Option<f64>,
}

fn falsy_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(value) => T::deserialize(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl StageOptions {
    /// Requested optional stages in fixed pipeline order.
    pub fn requested_stages(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|stage| self.is_requested(*stage))
            .collect()
    }

    pub fn is_requested(&self, stage: StageName) -> bool {
        match stage {
            StageName::BaseConversion => false,
            StageName::SuperResolution => self.superres.is_some(),
            StageName::Denoising => self.denoise == Some(true),
            StageName::SpeechToText => self.speech2text == Some(true),
            StageName::FramerateBoost => self.framerateboost.is_some(),
        }
    }

    pub fn optional_count(&self) -> usize {
        self.requested_stages().len()
    }

    /// Check values the type system cannot express.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(res) = &self.superres {
            if parse_multiplier(res).is_none() {
                errors.push(format!(
                    "'superres' must be a resolution multiplier such as 'x2' or 'x4', got '{res}'"
                ));
            }
        }

        if let Some(fps) = self.framerateboost {
            if !(fps.is_finite() && fps > 0.0) {
                errors.push("'framerateboost' must be a positive number".to_string());
            }
        }

        errors
    }
}

/// Parse an `xN` multiplier string.
fn parse_multiplier(value: &str) -> Option<u32> {
    value
        .strip_prefix('x')
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n > 1)
}

// ---------------------------------------------------------------------------
// Admission request
// ---------------------------------------------------------------------------

/// Job description handed over by the admission layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Present when resubmitting a job so it resumes from its checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Ordered input image paths.
    pub input: Vec<String>,
    pub fps: f64,
    #[serde(default)]
    pub ai_options: StageOptions,
}

impl JobRequest {
    /// Validate the request shape and every referenced input file.
    ///
    /// Returns an empty `Vec` if valid; otherwise every problem found.
    pub fn validate(&self, max_file_size_bytes: u64) -> Vec<String> {
        let mut errors = Vec::new();

        if self.input.is_empty() {
            errors.push("'input' must contain at least one image path".to_string());
        }

        if !(self.fps.is_finite() && self.fps > 0.0) {
            errors.push("'fps' must be a positive number".to_string());
        }

        if let Some(id) = &self.job_id {
            if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
                errors.push(format!("'job_id' is not a valid identifier: '{id}'"));
            }
        }

        for path in &self.input {
            if let Some(problem) = check_input_file(Path::new(path), max_file_size_bytes) {
                errors.push(problem);
            }
        }

        errors.extend(self.ai_options.validate());
        errors
    }
}

fn check_input_file(path: &Path, max_file_size_bytes: u64) -> Option<String> {
    let display = path.display();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {}
        _ => {
            return Some(format!(
                "{display}: unsupported file type (allowed: {})",
                ALLOWED_EXTENSIONS.join(", ")
            ))
        }
    }

    match std::fs::metadata(path) {
        Ok(meta) if !meta.is_file() => Some(format!("{display}: not a regular file")),
        Ok(meta) if meta.len() > max_file_size_bytes => Some(format!(
            "{display}: {} bytes exceeds the {max_file_size_bytes} byte limit",
            meta.len()
        )),
        Ok(_) => None,
        Err(_) => Some(format!("{display}: file does not exist")),
    }
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    /// Statuses reachable from `self`.
    ///
    /// `Failed -> Running` is a resubmission; `Complete` is terminal.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Complete, Self::Failed],
            Self::Failed => &[Self::Running],
            Self::Complete => &[],
        }
    }

    pub fn can_transition(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// An admitted unit of work. Mutated only by the pipeline executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub inputs: Vec<PathBuf>,
    pub fps: f64,
    pub options: StageOptions,
    pub priority: Priority,
    /// Index into [`Job::planned_stages`] of the stage being worked on.
    pub current_stage: usize,
    pub status: JobStatus,
    pub created_at: Timestamp,
}

impl Job {
    pub fn new(
        id: JobId,
        inputs: Vec<PathBuf>,
        fps: f64,
        options: StageOptions,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            inputs,
            fps,
            options,
            priority,
            current_stage: 0,
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
        }
    }

    /// The base stage followed by every requested optional stage, in order.
    pub fn planned_stages(&self) -> Vec<StageName> {
        let mut stages = vec![StageName::BaseConversion];
        stages.extend(self.options.requested_stages());
        stages
    }

    pub fn total_stages(&self) -> u32 {
        crate::progress::total_stages(self.options.optional_count())
    }

    /// Parameters a stage runs with, implicit defaults included.
    pub fn stage_params(&self, stage: StageName) -> StageParams {
        let mut params = StageParams::new();
        match stage {
            StageName::BaseConversion => {
                params.insert("fps".into(), json!(self.fps));
            }
            StageName::SuperResolution => {
                if let Some(res) = &self.options.superres {
                    params.insert("resolution".into(), json!(res));
                }
            }
            StageName::Denoising => {
                params.insert("temporal_strength".into(), json!(DEFAULT_TEMPORAL_STRENGTH));
                params.insert("spatial_strength".into(), json!(DEFAULT_SPATIAL_STRENGTH));
            }
            StageName::SpeechToText => {
                params.insert("model".into(), json!(DEFAULT_TRANSCRIPTION_MODEL));
            }
            StageName::FramerateBoost => {
                if let Some(fps) = self.options.framerateboost {
                    params.insert("target_fps".into(), json!(fps));
                }
            }
        }
        params
    }

    /// The full parameter set that determines the job's final artifact.
    pub fn effective_parameters(&self) -> StageParams {
        let stages = self.planned_stages();
        let mut params = StageParams::new();
        params.insert("fps".into(), json!(self.fps));
        params.insert(
            "stages".into(),
            json!(stages.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
        );
        for stage in stages {
            params.insert(stage.as_str().into(), json!(self.stage_params(stage)));
        }
        params
    }

    /// Move the job to `to`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition(to) {
            return Err(CoreError::InvalidTransition(format!(
                "job {}: {:?} -> {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    fn job_with(options: StageOptions) -> Job {
        Job::new(
            "job-1".into(),
            vec![PathBuf::from("/in/a.png")],
            24.0,
            options,
            Priority::Medium,
        )
    }

    fn image_file(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"not really a png").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn falsy_options_deserialize_as_absent() {
        let opts: StageOptions = serde_json::from_value(json!({
            "superres": false,
            "denoise": null,
            "speech2text": false,
            "framerateboost": false,
        }))
        .unwrap();
        assert_eq!(opts, StageOptions::default());
        assert_eq!(opts.optional_count(), 0);
    }

    #[test]
    fn truthy_options_deserialize() {
        let opts: StageOptions = serde_json::from_value(json!({
            "superres": "x4",
            "denoise": true,
            "framerateboost": 60,
        }))
        .unwrap();
        assert_eq!(opts.superres.as_deref(), Some("x4"));
        assert_eq!(opts.framerateboost, Some(60.0));
        assert_eq!(
            opts.requested_stages(),
            vec![
                StageName::SuperResolution,
                StageName::Denoising,
                StageName::FramerateBoost
            ]
        );
    }

    #[test]
    fn unknown_option_key_is_rejected() {
        let result: Result<StageOptions, _> =
            serde_json::from_value(json!({ "colorize": true }));
        assert!(result.is_err());
    }

    #[test]
    fn superres_multiplier_is_validated() {
        let opts = StageOptions {
            superres: Some("huge".into()),
            ..Default::default()
        };
        let errors = opts.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("superres"));
    }

    #[test]
    fn non_positive_framerate_boost_rejected() {
        let opts = StageOptions {
            framerateboost: Some(0.0),
            ..Default::default()
        };
        assert!(opts.validate()[0].contains("framerateboost"));
    }

    #[test]
    fn request_with_existing_images_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let request = JobRequest {
            job_id: None,
            input: vec![image_file(&dir, "a.png"), image_file(&dir, "b.JPG")],
            fps: 24.0,
            ai_options: StageOptions::default(),
        };
        assert!(request.validate(1024).is_empty());
    }

    #[test]
    fn request_collects_every_problem() {
        let dir = tempfile::tempdir().unwrap();
        let request = JobRequest {
            job_id: Some("../escape".into()),
            input: vec![
                dir.path().join("missing.png").to_string_lossy().into_owned(),
                image_file(&dir, "notes.txt"),
            ],
            fps: -1.0,
            ai_options: StageOptions::default(),
        };
        let errors = request.validate(1024);
        assert_eq!(errors.len(), 4, "{errors:?}");
    }

    #[test]
    fn oversized_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let request = JobRequest {
            job_id: None,
            input: vec![image_file(&dir, "big.png")],
            fps: 24.0,
            ai_options: StageOptions::default(),
        };
        let errors = request.validate(4);
        assert!(errors[0].contains("exceeds"));
    }

    #[test]
    fn empty_input_rejected() {
        let request = JobRequest {
            job_id: None,
            input: vec![],
            fps: 24.0,
            ai_options: StageOptions::default(),
        };
        assert!(request.validate(1024)[0].contains("at least one"));
    }

    #[test]
    fn planned_stages_start_with_base() {
        let job = job_with(StageOptions {
            speech2text: Some(true),
            superres: Some("x2".into()),
            ..Default::default()
        });
        assert_eq!(
            job.planned_stages(),
            vec![
                StageName::BaseConversion,
                StageName::SuperResolution,
                StageName::SpeechToText
            ]
        );
        assert_eq!(job.total_stages(), 3);
    }

    #[test]
    fn effective_parameters_include_implicit_defaults() {
        let job = job_with(StageOptions {
            denoise: Some(true),
            ..Default::default()
        });
        let params = job.effective_parameters();
        assert_eq!(params["fps"], json!(24.0));
        assert_eq!(params["stages"], json!(["base_conversion", "denoising"]));
        assert_eq!(params["denoising"]["temporal_strength"], json!(4));
        assert_eq!(params["denoising"]["spatial_strength"], json!(3));
    }

    #[test]
    fn status_machine() {
        let mut job = job_with(StageOptions::default());
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Failed).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Complete).unwrap();
        assert_matches!(
            job.transition(JobStatus::Running),
            Err(CoreError::InvalidTransition(_))
        );
    }
}
