//! Job orchestration: checkpointed, cached execution of the stage pipeline.
//!
//! - [`checkpoint`] persists per-job stage completion so a resubmitted job
//!   resumes instead of restarting.
//! - [`cache`] maps a content fingerprint to a previously produced artifact.
//! - [`runner`] is the seam through which stages are invoked.
//! - [`executor`] drives a job through its stages.
//! - [`result`] turns an execution outcome into the caller-facing payload.

pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod executor;
mod fs;
pub mod result;
pub mod runner;

pub use cache::{CacheEntry, Fingerprint, FingerprintCache};
pub use checkpoint::{CheckpointRecord, CheckpointStore, LastError};
pub use error::PipelineError;
pub use executor::{JobOutput, PipelineConfig, PipelineExecutor};
pub use result::{ResultPayload, ResultStatus};
pub use runner::{CommandRunner, StageOutcome, StageRequest, StageRunner};
