//! Content-addressed cache of finished artifacts.
//!
//! The key is derived from the *content* of the inputs and the full
//! effective parameter set, so renamed-but-identical inputs hit and a file
//! changed in place misses. Each entry is a small JSON file named after
//! its fingerprint.
//!
//! Entries never point at a job's output path, which a later run of the same
//! job id may overwrite. `put` copies the artifact and its side outputs into
//! `artifacts/` under names derived from the fingerprint, and the entry
//! points at those copies.
//!
//! An entry is only a hit while every file it points to exists. Dangling
//! entries read as misses and are removed together with their copies.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use framepipe_core::hashing::{sha256_file, sha256_hex};
use framepipe_core::stages::{StageName, StageParams};
use framepipe_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::fs;

/// Deterministic cache key: `{operation}_{inputs hash}_{params hash}`.
pub type Fingerprint = String;

/// Operation name used for the whole image-to-video pipeline.
pub const PIPELINE_OPERATION: &str = "image_to_video";

/// Sub-directory of the cache holding the stored artifact copies.
pub const ARTIFACT_SUBDIR: &str = "artifacts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub artifact_path: PathBuf,
    /// Side outputs produced alongside the artifact (e.g. a transcription).
    #[serde(default)]
    pub side_outputs: BTreeMap<StageName, PathBuf>,
    pub created_at: Timestamp,
}

impl CacheEntry {
    fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.artifact_path).chain(self.side_outputs.values())
    }
}

/// Rebuild `value` with object keys in sorted order at every depth.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintCache {
    dir: PathBuf,
}

impl FingerprintCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    fn artifact_dir(&self) -> PathBuf {
        self.dir.join(ARTIFACT_SUBDIR)
    }

    /// Stored copy of the main artifact: `artifacts/{fingerprint}.{ext}`.
    fn stored_artifact_path(&self, fingerprint: &str, source: &Path) -> PathBuf {
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mp4".to_string());
        self.artifact_dir().join(format!("{fingerprint}.{ext}"))
    }

    /// Stored copy of a side output: `artifacts/{fingerprint}_{stage}.{ext}`.
    fn stored_side_output_path(&self, fingerprint: &str, stage: StageName) -> PathBuf {
        self.artifact_dir()
            .join(format!("{fingerprint}_{stage}.{}", stage.output_extension()))
    }

    /// Compute the fingerprint of `inputs` (in order) under `operation`
    /// with `parameters`.
    ///
    /// Input files are hashed on the blocking pool.
    pub async fn key(
        inputs: &[PathBuf],
        operation: &str,
        parameters: &StageParams,
    ) -> Result<Fingerprint, PipelineError> {
        let paths = inputs.to_vec();
        let content_hashes = tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .map(|p| sha256_file(p))
                .collect::<io::Result<Vec<String>>>()
        })
        .await
        .map_err(|e| PipelineError::Storage(io::Error::other(e)))??;

        let inputs_hash = sha256_hex(content_hashes.join("\n").as_bytes());

        let params = canonicalize(&serde_json::to_value(parameters)?);
        let params_hash = sha256_hex(serde_json::to_string(&params)?.as_bytes());

        Ok(format!("{operation}_{inputs_hash}_{params_hash}"))
    }

    /// Look up a fingerprint. Returns `None` on a miss or a dangling entry.
    pub async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>, PipelineError> {
        let path = self.entry_path(fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(fingerprint, error = %e, "Unreadable cache entry, treating as miss");
                self.evict(&path, None).await;
                return Ok(None);
            }
        };

        for artifact in entry.paths() {
            if !fs::is_non_empty_file(artifact).await {
                tracing::debug!(
                    fingerprint,
                    path = %artifact.display(),
                    "Cached artifact is gone, treating as miss"
                );
                self.evict(&path, Some(&entry)).await;
                return Ok(None);
            }
        }

        tracing::debug!(fingerprint, "Cache hit");
        Ok(Some(entry))
    }

    /// Store copies of `artifact_path` and its side outputs under
    /// `fingerprint`.
    ///
    /// The sources are left in place. The returned entry points at the
    /// copies, so later changes to the sources never alter what a hit serves.
    pub async fn put(
        &self,
        fingerprint: &str,
        artifact_path: &Path,
        side_outputs: BTreeMap<StageName, PathBuf>,
    ) -> Result<CacheEntry, PipelineError> {
        let stored_artifact = self.stored_artifact_path(fingerprint, artifact_path);
        fs::copy_atomic(artifact_path, &stored_artifact).await?;

        let mut stored_side_outputs = BTreeMap::new();
        for (stage, path) in side_outputs {
            let stored = self.stored_side_output_path(fingerprint, stage);
            fs::copy_atomic(&path, &stored).await?;
            stored_side_outputs.insert(stage, stored);
        }

        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            artifact_path: stored_artifact,
            side_outputs: stored_side_outputs,
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        fs::write_atomic(&self.entry_path(fingerprint), &bytes).await?;
        tracing::debug!(
            fingerprint,
            path = %entry.artifact_path.display(),
            "Cache entry stored"
        );
        Ok(entry)
    }

    /// Drop an entry file and whatever stored copies it still references.
    async fn evict(&self, entry_path: &Path, entry: Option<&CacheEntry>) {
        if let Err(e) = fs::remove_if_exists(entry_path).await {
            tracing::warn!(path = %entry_path.display(), error = %e, "Failed to evict cache entry");
        }
        let Some(entry) = entry else {
            return;
        };
        let artifact_dir = self.artifact_dir();
        for path in entry.paths().filter(|p| p.starts_with(&artifact_dir)) {
            if let Err(e) = fs::remove_if_exists(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove cached artifact");
            }
        }
    }
}
