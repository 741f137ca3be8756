//! Process-level wiring: event bus, resource monitor and executor.

use std::sync::Arc;

use framepipe_events::EventBus;
use framepipe_monitor::{MonitorError, MonitorHandle, ResourceMonitor, SampleSource, SystemCollector};
use framepipe_pipeline::{CommandRunner, PipelineExecutor, ResultPayload, StageRunner};
use tokio_util::sync::CancellationToken;

use crate::admission;
use crate::config::WorkerConfig;

/// A configured worker. The monitor runs between [`Worker::start`] and
/// [`Worker::shutdown`].
pub struct Worker {
    config: WorkerConfig,
    bus: Arc<EventBus>,
    monitor: Arc<ResourceMonitor>,
    executor: PipelineExecutor,
    cancel: CancellationToken,
    monitor_handle: Option<MonitorHandle>,
}

impl Worker {
    /// Worker running stages as external processes and sampling this host.
    pub fn new(config: WorkerConfig) -> Self {
        let collector = SystemCollector::new(&config.monitor_disk_path);
        Self::with_parts(config, Arc::new(CommandRunner::new()), collector)
    }

    /// Worker with an explicit stage runner and sample source.
    pub fn with_parts(
        config: WorkerConfig,
        runner: Arc<dyn StageRunner>,
        source: impl SampleSource,
    ) -> Self {
        let bus = Arc::new(EventBus::default());
        let monitor = Arc::new(
            ResourceMonitor::new(config.monitor_config(), source).with_event_bus(Arc::clone(&bus)),
        );
        let executor = PipelineExecutor::new(config.pipeline_config(), runner)
            .with_monitor(Arc::clone(&monitor))
            .with_event_bus(Arc::clone(&bus));

        Self {
            config,
            bus,
            monitor,
            executor,
            cancel: CancellationToken::new(),
            monitor_handle: None,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Start background resource sampling. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.monitor_handle.is_none() {
            self.monitor_handle = Some(self.monitor.start(self.cancel.clone()));
        }
    }

    /// Admit and execute one JSON job description.
    ///
    /// Every failure, including a rejected request, becomes an error payload.
    pub async fn run_request(&self, json: &str) -> ResultPayload {
        let admitted = admission::parse_request(json)
            .and_then(|request| admission::admit(request, self.config.max_file_size_bytes()));

        let mut job = match admitted {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(error = %e, "Job rejected");
                return ResultPayload::error(e.to_string());
            }
        };

        let result = self.executor.execute(&mut job).await;
        ResultPayload::from(&result)
    }

    /// Stop the monitor and wait for its loop to exit.
    pub async fn shutdown(mut self) -> Result<(), MonitorError> {
        self.cancel.cancel();
        if let Some(handle) = self.monitor_handle.take() {
            handle.stop().await?;
        }
        tracing::info!("Worker shut down");
        Ok(())
    }
}
