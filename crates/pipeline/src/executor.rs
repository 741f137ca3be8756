//! Drives a job through its stage sequence.
//!
//! Per job:
//!
//! 1. Fingerprint the inputs and effective parameters; a validated cache
//!    hit copies the stored artifact to the job's output path without
//!    running anything.
//! 2. Load the checkpoint and find the longest prefix of planned stages
//!    whose outputs still exist and were produced with the current
//!    parameters. Those stages are skipped.
//! 3. Run every remaining stage in order, checkpointing and reporting
//!    progress after each one. The first failure stops the job.
//! 4. On success, promote the final artifact (and side outputs) into the
//!    output directory, store a copy in the cache, and drop the checkpoint
//!    and intermediates.
//!
//! A failed job is not retried here. Resubmitting it with the same job id
//! resumes from the checkpoint until a stage exhausts its failure budget.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use framepipe_core::job::{Job, JobStatus};
use framepipe_core::progress::{ProgressReport, ProgressTracker};
use framepipe_core::stages::{StageCatalog, StageName};
use framepipe_core::types::JobId;
use framepipe_events::{event_types, EventBus, PipelineEvent};
use framepipe_monitor::ResourceMonitor;
use serde_json::json;
use tokio::sync::RwLock;

use crate::cache::{CacheEntry, Fingerprint, FingerprintCache, PIPELINE_OPERATION};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::error::PipelineError;
use crate::fs;
use crate::runner::{StageOutcome, StageRequest, StageRunner};

/// Sub-directory of the work directory holding checkpoint records.
pub const CHECKPOINT_SUBDIR: &str = "checkpoints";

// ---------------------------------------------------------------------------
// Configuration and output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where finished artifacts are placed.
    pub output_dir: PathBuf,
    /// Root of the per-job intermediate directories.
    pub work_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub catalog: StageCatalog,
}

impl PipelineConfig {
    /// Standard layout: checkpoints live under `temp_dir/checkpoints`.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        catalog: StageCatalog,
    ) -> Self {
        let work_dir = temp_dir.into();
        Self {
            output_dir: output_dir.into(),
            checkpoint_dir: work_dir.join(CHECKPOINT_SUBDIR),
            work_dir,
            cache_dir: cache_dir.into(),
            catalog,
        }
    }

    /// Canonical path of a job's final artifact.
    pub fn artifact_path(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(format!("{job_id}_output.mp4"))
    }

    /// Canonical path of a side output, e.g. `<job>_transcription.txt`.
    pub fn side_output_path(&self, job_id: &str, stage: StageName) -> PathBuf {
        let label = match stage {
            StageName::SpeechToText => "transcription",
            other => other.as_str(),
        };
        self.output_dir
            .join(format!("{job_id}_{label}.{}", stage.output_extension()))
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.work_dir.join(job_id)
    }
}

/// A successfully finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub job_id: JobId,
    pub artifact_path: PathBuf,
    pub side_outputs: BTreeMap<StageName, PathBuf>,
    /// `true` when served from the fingerprint cache without running stages.
    pub cached: bool,
    pub fingerprint: Fingerprint,
}

impl JobOutput {
    pub fn transcription(&self) -> Option<&Path> {
        self.side_outputs
            .get(&StageName::SpeechToText)
            .map(PathBuf::as_path)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct PipelineExecutor {
    config: PipelineConfig,
    checkpoints: CheckpointStore,
    cache: FingerprintCache,
    runner: Arc<dyn StageRunner>,
    monitor: Option<Arc<ResourceMonitor>>,
    bus: Option<Arc<EventBus>>,
    progress: RwLock<HashMap<JobId, ProgressReport>>,
}

impl PipelineExecutor {
    pub fn new(config: PipelineConfig, runner: Arc<dyn StageRunner>) -> Self {
        Self {
            checkpoints: CheckpointStore::new(&config.checkpoint_dir),
            cache: FingerprintCache::new(&config.cache_dir),
            config,
            runner,
            monitor: None,
            bus: None,
            progress: RwLock::new(HashMap::new()),
        }
    }

    /// Consult `monitor` for advisory warnings before each stage.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Latest progress report of a job that is currently executing.
    pub async fn progress(&self, job_id: &str) -> Option<ProgressReport> {
        self.progress.read().await.get(job_id).cloned()
    }

    /// Run `job` to completion or to its first failing stage.
    pub async fn execute(&self, job: &mut Job) -> Result<JobOutput, PipelineError> {
        job.transition(JobStatus::Running)?;
        tracing::info!(
            job_id = %job.id,
            priority = %job.priority,
            stages = ?job.planned_stages(),
            "Job started"
        );

        let result = self.run(job).await;
        self.progress.write().await.remove(&job.id);

        match &result {
            Ok(output) => {
                job.transition(JobStatus::Complete)?;
                tracing::info!(
                    job_id = %job.id,
                    artifact = %output.artifact_path.display(),
                    cached = output.cached,
                    "Job complete"
                );
                self.emit(
                    PipelineEvent::new(event_types::JOB_COMPLETED)
                        .with_job(&job.id)
                        .with_payload(json!({
                            "output": output.artifact_path,
                            "transcription": output.transcription(),
                            "cached": output.cached,
                        })),
                );
            }
            Err(e) => {
                job.transition(JobStatus::Failed)?;
                tracing::error!(job_id = %job.id, error = %e, "Job failed");
                let mut event = PipelineEvent::new(event_types::JOB_FAILED)
                    .with_job(&job.id)
                    .with_payload(json!({
                        "error": e.to_string(),
                        "resumable": e.is_resumable(),
                    }));
                if let Some(stage) = e.stage() {
                    event = event.with_stage(stage);
                }
                self.emit(event);
            }
        }

        result
    }

    async fn run(&self, job: &mut Job) -> Result<JobOutput, PipelineError> {
        let stages = job.planned_stages();
        let fingerprint =
            FingerprintCache::key(&job.inputs, PIPELINE_OPERATION, &job.effective_parameters())
                .await?;

        if let Some(entry) = self.cache.get(&fingerprint).await? {
            tracing::info!(job_id = %job.id, fingerprint = %fingerprint, "Cache hit, skipping stages");
            if self.checkpoints.exists(&job.id).await {
                self.discard_job_state(&job.id).await;
            }
            let output = self.materialize(job, fingerprint, entry).await?;
            job.current_stage = stages.len();
            let total = job.total_stages();
            self.publish_progress(&job.id, ProgressTracker::resumed(total, total).report("cached"))
                .await;
            return Ok(output);
        }

        let record = self.checkpoints.load(&job.id).await?;
        let resume = self.resume_point(job, &record, &stages).await;

        let mut forward = job.inputs.clone();
        let mut side_outputs = BTreeMap::new();
        for stage in &stages[..resume] {
            if let Some(path) = record.intermediate_files.get(stage) {
                if stage.is_side_output() {
                    side_outputs.insert(*stage, path.clone());
                } else {
                    forward = vec![path.clone()];
                }
            }
        }
        if resume > 0 {
            tracing::info!(
                job_id = %job.id,
                skipped = ?&stages[..resume],
                "Resuming from checkpoint"
            );
        }

        let mut tracker = ProgressTracker::resumed(job.total_stages(), resume as u32);
        self.publish_progress(&job.id, tracker.report("started")).await;

        let job_dir = self.config.job_dir(&job.id);
        tokio::fs::create_dir_all(&job_dir).await?;

        for (idx, &stage) in stages.iter().enumerate().skip(resume) {
            job.current_stage = idx;
            let output = self.run_stage(job, stage, &forward, &job_dir).await?;
            if stage.is_side_output() {
                side_outputs.insert(stage, output);
            } else {
                forward = vec![output];
            }
            let report = tracker.advance_with_status(1, format!("{stage} complete"));
            self.publish_progress(&job.id, report).await;
        }
        job.current_stage = stages.len();

        let final_artifact = forward
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Validation("job has no input".into()))?;
        self.finish(job, fingerprint, final_artifact, side_outputs)
            .await
    }

    /// Number of leading planned stages that can be skipped.
    async fn resume_point(
        &self,
        job: &Job,
        record: &CheckpointRecord,
        stages: &[StageName],
    ) -> usize {
        let mut resume = 0;
        for &stage in stages {
            if record.validated_output(stage).await.is_none() {
                break;
            }
            if record.parameters.get(&stage) != Some(&job.stage_params(stage)) {
                tracing::warn!(
                    job_id = %job.id,
                    stage = %stage,
                    "Checkpointed stage ran with different parameters, re-running"
                );
                break;
            }
            resume += 1;
        }
        resume
    }

    async fn run_stage(
        &self,
        job: &Job,
        stage: StageName,
        inputs: &[PathBuf],
        job_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let descriptor = self.config.catalog.get(stage);
        let policy = descriptor.policy;

        if !self
            .checkpoints
            .should_retry(&job.id, stage, policy.max_retries)
            .await?
        {
            return Err(self.abandon(job, stage).await);
        }

        self.log_resource_pressure(job, stage).await;

        let output = job_dir.join(descriptor.output_file_name(&job.id));
        // Leftovers from an interrupted attempt are never trusted.
        fs::remove_if_exists(&output).await?;
        let params = job.stage_params(stage);
        self.checkpoints.record_step_started(&job.id, stage).await?;

        let queue = stage.default_queue().queue_name();
        tracing::info!(job_id = %job.id, stage = %stage, queue, "Stage started");
        self.emit(
            PipelineEvent::new(event_types::JOB_STAGE_STARTED)
                .with_job(&job.id)
                .with_stage(stage)
                .with_payload(json!({ "queue": queue })),
        );

        let request = StageRequest {
            job_id: job.id.clone(),
            stage,
            command: descriptor.command.clone(),
            inputs: inputs.to_vec(),
            output: output.clone(),
            params: params.clone(),
            timeout: policy.timeout,
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(policy.timeout, self.runner.run(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => StageOutcome::Timeout {
                elapsed: started.elapsed(),
            },
        };

        let failure = match outcome {
            StageOutcome::Complete if fs::is_non_empty_file(&output).await => None,
            StageOutcome::Complete => Some(PipelineError::StageFailed {
                stage,
                reason: format!("no output written to {}", output.display()),
            }),
            StageOutcome::Failed { reason } => Some(PipelineError::StageFailed { stage, reason }),
            StageOutcome::Timeout { elapsed } => Some(PipelineError::Timeout {
                stage,
                elapsed_secs: elapsed.as_secs(),
            }),
        };

        if let Some(err) = failure {
            if let Err(e) = fs::remove_if_exists(&output).await {
                tracing::warn!(job_id = %job.id, stage = %stage, error = %e, "Failed to discard partial output");
            }
            self.checkpoints
                .record_step_failed(&job.id, stage, &err.to_string())
                .await?;
            tracing::warn!(job_id = %job.id, stage = %stage, error = %err, "Stage failed");
            self.emit(
                PipelineEvent::new(event_types::JOB_STAGE_FAILED)
                    .with_job(&job.id)
                    .with_stage(stage)
                    .with_payload(json!({ "error": err.to_string() })),
            );
            return Err(err);
        }

        self.checkpoints
            .record_step_done(&job.id, stage, &output, params)
            .await?;
        tracing::info!(
            job_id = %job.id,
            stage = %stage,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stage completed"
        );
        self.emit(
            PipelineEvent::new(event_types::JOB_STAGE_COMPLETED)
                .with_job(&job.id)
                .with_stage(stage)
                .with_payload(json!({ "output": output })),
        );
        Ok(output)
    }

    /// Give up on a job whose stage has used up its failure budget.
    async fn abandon(&self, job: &Job, stage: StageName) -> PipelineError {
        let record = self.checkpoints.load(&job.id).await.ok();
        let attempts = record.as_ref().map_or(0, |r| r.failures(stage));
        let last_error = record
            .and_then(|r| r.last_error)
            .map(|e| e.error)
            .unwrap_or_default();

        tracing::error!(
            job_id = %job.id,
            stage = %stage,
            attempts,
            "Failure budget exhausted, abandoning job"
        );
        self.discard_job_state(&job.id).await;

        PipelineError::RetriesExhausted {
            stage,
            attempts,
            last_error,
        }
    }

    async fn finish(
        &self,
        job: &Job,
        fingerprint: Fingerprint,
        final_artifact: PathBuf,
        side_outputs: BTreeMap<StageName, PathBuf>,
    ) -> Result<JobOutput, PipelineError> {
        let mut promoted = BTreeMap::new();
        for (stage, path) in side_outputs {
            let dst = self.config.side_output_path(&job.id, stage);
            fs::promote(&path, &dst).await?;
            promoted.insert(stage, dst);
        }

        // The canonical artifact appears last, only once everything else is in place.
        let artifact_path = self.config.artifact_path(&job.id);
        fs::promote(&final_artifact, &artifact_path).await?;

        if let Err(e) = self
            .cache
            .put(&fingerprint, &artifact_path, promoted.clone())
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to cache artifact");
        }
        self.discard_job_state(&job.id).await;

        Ok(JobOutput {
            job_id: job.id.clone(),
            artifact_path,
            side_outputs: promoted,
            cached: false,
            fingerprint,
        })
    }

    /// Copy a cached artifact and its side outputs to this job's output paths.
    async fn materialize(
        &self,
        job: &Job,
        fingerprint: Fingerprint,
        entry: CacheEntry,
    ) -> Result<JobOutput, PipelineError> {
        let mut side_outputs = BTreeMap::new();
        for (stage, stored) in &entry.side_outputs {
            let dst = self.config.side_output_path(&job.id, *stage);
            fs::copy_atomic(stored, &dst).await?;
            side_outputs.insert(*stage, dst);
        }

        let artifact_path = self.config.artifact_path(&job.id);
        fs::copy_atomic(&entry.artifact_path, &artifact_path).await?;

        Ok(JobOutput {
            job_id: job.id.clone(),
            artifact_path,
            side_outputs,
            cached: true,
            fingerprint,
        })
    }

    /// Remove the checkpoint and the job's intermediate directory.
    async fn discard_job_state(&self, job_id: &str) {
        self.checkpoints.cleanup(job_id).await;
        let job_dir = self.config.job_dir(job_id);
        match tokio::fs::remove_dir_all(&job_dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(job_id, path = %job_dir.display(), error = %e, "Failed to remove work directory");
            }
            _ => {}
        }
    }

    async fn log_resource_pressure(&self, job: &Job, stage: StageName) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        for warning in monitor.latest_warnings().await {
            tracing::warn!(job_id = %job.id, stage = %stage, "Starting stage under resource pressure: {warning}");
        }
    }

    async fn publish_progress(&self, job_id: &str, report: ProgressReport) {
        tracing::debug!(
            job_id,
            percent = report.percent,
            eta_secs = report.estimated_seconds_remaining,
            "Progress"
        );
        self.emit(
            PipelineEvent::new(event_types::JOB_PROGRESS)
                .with_job(job_id)
                .with_payload(json!(report)),
        );
        self.progress
            .write()
            .await
            .insert(job_id.to_string(), report);
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}
