//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the pipeline executor,
//! the resource monitor and whoever observes them.

use chrono::{DateTime, Utc};
use framepipe_core::types::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Dot-separated event names published by the workspace.
pub mod event_types {
    pub const JOB_PROGRESS: &str = "job.progress";
    pub const JOB_STAGE_STARTED: &str = "job.stage_started";
    pub const JOB_STAGE_COMPLETED: &str = "job.stage_completed";
    pub const JOB_STAGE_FAILED: &str = "job.stage_failed";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const RESOURCE_WARNING: &str = "resource.warning";
}

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Something observable happened in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// One of [`event_types`].
    pub event_type: String,

    /// Job the event belongs to; `None` for host-level events.
    pub job_id: Option<JobId>,

    /// Stage the event belongs to, if any.
    pub stage: Option<String>,

    /// Event-specific data (progress report, warning, error message).
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Create a new event with only the required `event_type`.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            job_id: None,
            stage: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_stage(mut self, stage: impl ToString) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: PipelineEvent) {
        tracing::trace!(event_type = %event.event_type, job_id = ?event.job_id, "Publishing event");
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
