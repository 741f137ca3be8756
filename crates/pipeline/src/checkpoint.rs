//! Durable per-job checkpoint records.
//!
//! One JSON file per job id lives in the checkpoint directory. Every
//! mutating call rewrites the record atomically and flushes it before
//! returning, so a crash right after a stage completes never loses the
//! completion.
//!
//! A record is only trusted together with the filesystem: a stage counts
//! as completed when it is listed in `completed_steps` **and** its
//! intermediate file still exists. Anything else means "run it again".

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use framepipe_core::stages::{StageName, StageParams};
use framepipe_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::fs;

/// The most recent stage failure of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub step: StageName,
    pub error: String,
    /// Failure count of `step` including this one.
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub job_id: JobId,
    /// Completed stages in completion order, without duplicates.
    pub completed_steps: Vec<StageName>,
    /// Stage being attempted when the record was last written.
    #[serde(default)]
    pub current_step: Option<StageName>,
    pub intermediate_files: BTreeMap<StageName, PathBuf>,
    /// Parameters each completed stage actually ran with.
    pub parameters: BTreeMap<StageName, StageParams>,
    pub error_count: BTreeMap<StageName, u32>,
    #[serde(default)]
    pub last_error: Option<LastError>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl CheckpointRecord {
    pub fn new(job_id: impl Into<JobId>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            completed_steps: Vec::new(),
            current_step: None,
            intermediate_files: BTreeMap::new(),
            parameters: BTreeMap::new(),
            error_count: BTreeMap::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self, stage: StageName) -> bool {
        self.completed_steps.contains(&stage)
    }

    /// Output of a completed stage, if the file is still on storage.
    pub async fn validated_output(&self, stage: StageName) -> Option<&Path> {
        if !self.is_completed(stage) {
            return None;
        }
        let path = self.intermediate_files.get(&stage)?;
        if fs::is_non_empty_file(path).await {
            Some(path.as_path())
        } else {
            tracing::warn!(
                job_id = %self.job_id,
                stage = %stage,
                path = %path.display(),
                "Checkpointed output missing, stage will re-run"
            );
            None
        }
    }

    pub fn failures(&self, stage: StageName) -> u32 {
        self.error_count.get(&stage).copied().unwrap_or(0)
    }

    /// `true` while the stage has failed fewer than `max_retries` times.
    pub fn should_retry(&self, stage: StageName, max_retries: u32) -> bool {
        self.failures(stage) < max_retries
    }

    fn mark_started(&mut self, stage: StageName) {
        self.current_step = Some(stage);
    }

    fn mark_done(&mut self, stage: StageName, output: PathBuf, parameters: StageParams) {
        if !self.is_completed(stage) {
            self.completed_steps.push(stage);
        }
        self.intermediate_files.insert(stage, output);
        self.parameters.insert(stage, parameters);
        self.current_step = None;
    }

    fn mark_failed(&mut self, stage: StageName, reason: String) {
        let count = self.error_count.entry(stage).or_insert(0);
        *count += 1;
        self.last_error = Some(LastError {
            step: stage,
            error: reason,
            count: *count,
        });
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File-backed checkpoint store keyed by job id.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    /// Whether a record is stored for `job_id`.
    pub async fn exists(&self, job_id: &str) -> bool {
        tokio::fs::try_exists(self.record_path(job_id))
            .await
            .unwrap_or(false)
    }

    /// Load the record for `job_id`, or a fresh one if none is stored.
    ///
    /// An unreadable record is logged and replaced by a fresh one; every
    /// stage then simply runs again.
    pub async fn load(&self, job_id: &str) -> Result<CheckpointRecord, PipelineError> {
        let path = self.record_path(job_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(CheckpointRecord::new(job_id));
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CheckpointRecord>(&bytes) {
            Ok(record) if record.job_id == job_id => Ok(record),
            Ok(record) => {
                tracing::warn!(
                    job_id,
                    recorded_job_id = %record.job_id,
                    "Checkpoint belongs to another job, starting fresh"
                );
                Ok(CheckpointRecord::new(job_id))
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Corrupt checkpoint, starting fresh");
                Ok(CheckpointRecord::new(job_id))
            }
        }
    }

    /// Persist `record`, replacing any previous version.
    pub async fn save(&self, record: &mut CheckpointRecord) -> Result<(), PipelineError> {
        record.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write_atomic(&self.record_path(&record.job_id), &bytes).await?;
        tracing::debug!(job_id = %record.job_id, "Checkpoint saved");
        Ok(())
    }

    async fn update<F>(&self, job_id: &str, apply: F) -> Result<CheckpointRecord, PipelineError>
    where
        F: FnOnce(&mut CheckpointRecord),
    {
        let mut record = self.load(job_id).await?;
        apply(&mut record);
        self.save(&mut record).await?;
        Ok(record)
    }

    /// Note that `stage` is being attempted.
    pub async fn record_step_started(
        &self,
        job_id: &str,
        stage: StageName,
    ) -> Result<CheckpointRecord, PipelineError> {
        self.update(job_id, |r| r.mark_started(stage)).await
    }

    pub async fn record_step_done(
        &self,
        job_id: &str,
        stage: StageName,
        output: &Path,
        parameters: StageParams,
    ) -> Result<CheckpointRecord, PipelineError> {
        let output = output.to_path_buf();
        self.update(job_id, |r| r.mark_done(stage, output, parameters))
            .await
    }

    /// Count a failure of `stage`. Earlier completions are left untouched.
    pub async fn record_step_failed(
        &self,
        job_id: &str,
        stage: StageName,
        reason: &str,
    ) -> Result<CheckpointRecord, PipelineError> {
        let reason = reason.to_string();
        self.update(job_id, |r| r.mark_failed(stage, reason)).await
    }

    /// `true` iff `stage` is completed and its output file still exists.
    pub async fn can_resume_from(&self, job_id: &str, stage: StageName) -> Result<bool, PipelineError> {
        let record = self.load(job_id).await?;
        Ok(record.validated_output(stage).await.is_some())
    }

    pub async fn should_retry(
        &self,
        job_id: &str,
        stage: StageName,
        max_retries: u32,
    ) -> Result<bool, PipelineError> {
        Ok(self.load(job_id).await?.should_retry(stage, max_retries))
    }

    /// Parameters `stage` was completed with, if it was.
    pub async fn step_parameters(
        &self,
        job_id: &str,
        stage: StageName,
    ) -> Result<Option<StageParams>, PipelineError> {
        Ok(self.load(job_id).await?.parameters.remove(&stage))
    }

    /// Delete the record and every intermediate file it references.
    ///
    /// Best-effort: failures are logged and never returned.
    pub async fn cleanup(&self, job_id: &str) {
        let record = match self.load(job_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not read checkpoint for cleanup");
                CheckpointRecord::new(job_id)
            }
        };

        for (stage, path) in &record.intermediate_files {
            if let Err(e) = fs::remove_if_exists(path).await {
                tracing::warn!(
                    job_id,
                    stage = %stage,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete intermediate file"
                );
            }
        }

        match fs::remove_if_exists(&self.record_path(job_id)).await {
            Ok(()) => tracing::debug!(job_id, "Checkpoint removed"),
            Err(e) => tracing::error!(job_id, error = %e, "Failed to delete checkpoint"),
        }
    }
}
