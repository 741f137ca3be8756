//! Background resource sampling loop.
//!
//! [`ResourceMonitor`] is constructed explicitly, shared as
//! `Arc<ResourceMonitor>`, and started with [`ResourceMonitor::start`]. The
//! returned [`MonitorHandle`] must be stopped (and thereby joined) at
//! shutdown; dropping it only signals cancellation.
//!
//! Warnings are advisory. They are logged, kept as the latest warning set
//! and published on the event bus, but never affect running jobs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use framepipe_core::resources::{
    self, AverageStats, ResourceSample, ResourceThresholds, ResourceWarning,
};
use framepipe_events::{event_types, EventBus, PipelineEvent};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::SampleSource;

/// Default interval between samples.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of samples kept in the rolling window.
pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Sampling configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Capacity of the rolling history; the oldest sample is evicted first.
    pub max_history: usize,
    pub thresholds: ResourceThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_history: DEFAULT_MAX_HISTORY,
            thresholds: ResourceThresholds::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceMonitor
// ---------------------------------------------------------------------------

pub struct ResourceMonitor {
    config: MonitorConfig,
    source: Arc<Mutex<Box<dyn SampleSource>>>,
    history: RwLock<VecDeque<ResourceSample>>,
    latest_warnings: RwLock<Vec<ResourceWarning>>,
    bus: Option<Arc<EventBus>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, source: impl SampleSource) -> Self {
        let capacity = config.max_history.max(1);
        Self {
            config,
            source: Arc::new(Mutex::new(Box::new(source))),
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            latest_warnings: RwLock::new(Vec::new()),
            bus: None,
        }
    }

    /// Publish threshold warnings as `resource.warning` events.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Take a fresh sample without recording it.
    ///
    /// The source is read on the blocking pool so that slow drivers never
    /// stall the async runtime.
    pub async fn sample(&self) -> Result<ResourceSample, MonitorError> {
        let source = Arc::clone(&self.source);
        let sample = tokio::task::spawn_blocking(move || {
            // A panicking source leaves no partial state worth discarding.
            let mut source = source.lock().unwrap_or_else(PoisonError::into_inner);
            source.sample()
        })
        .await?;
        Ok(sample)
    }

    /// One warning per metric above its configured threshold.
    pub fn check_thresholds(&self, sample: &ResourceSample) -> Vec<ResourceWarning> {
        resources::check_thresholds(sample, &self.config.thresholds)
    }

    /// Append `sample` to the history, evaluate it and publish any warnings.
    pub async fn record(&self, sample: ResourceSample) -> Vec<ResourceWarning> {
        let warnings = self.check_thresholds(&sample);

        {
            let mut history = self.history.write().await;
            history.push_back(sample);
            while history.len() > self.config.max_history.max(1) {
                history.pop_front();
            }
        }

        for warning in &warnings {
            tracing::warn!(
                metric = ?warning.metric,
                value = warning.value,
                threshold = warning.threshold,
                "{warning}"
            );
            if let Some(bus) = &self.bus {
                bus.publish(PipelineEvent::new(event_types::RESOURCE_WARNING).with_payload(
                    serde_json::json!({
                        "metric": warning.metric,
                        "value": warning.value,
                        "threshold": warning.threshold,
                        "message": warning.to_string(),
                    }),
                ));
            }
        }

        *self.latest_warnings.write().await = warnings.clone();
        warnings
    }

    /// Sample once and record the result.
    pub async fn tick(&self) -> Result<Vec<ResourceWarning>, MonitorError> {
        let sample = self.sample().await?;
        Ok(self.record(sample).await)
    }

    /// Average over the samples taken within the last `window`.
    ///
    /// Returns `None` when no sample falls inside the window.
    pub async fn history(&self, window: Duration) -> Option<AverageStats> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(window);
        let history = self.history.read().await;
        resources::average(
            history
                .iter()
                .filter(|s| cutoff.is_none_or(|cutoff| s.timestamp >= cutoff)),
        )
    }

    pub async fn latest(&self) -> Option<ResourceSample> {
        self.history.read().await.back().cloned()
    }

    /// Warnings raised by the most recent sample.
    pub async fn latest_warnings(&self) -> Vec<ResourceWarning> {
        self.latest_warnings.read().await.clone()
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    /// Spawn the sampling loop.
    ///
    /// The loop stops when `cancel` (or the returned handle) is cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> MonitorHandle {
        let cancel = cancel.child_token();
        let monitor = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { monitor.run(token).await });
        MonitorHandle {
            cancel,
            task: Some(task),
        }
    }

    async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_history = self.config.max_history,
            "Resource monitor started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Resource monitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(warnings) if warnings.is_empty() => {
                            tracing::debug!("Resource sample recorded");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Resource sampling failed");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorHandle
// ---------------------------------------------------------------------------

/// Owns the running sampling task.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(mut self) -> Result<(), MonitorError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
