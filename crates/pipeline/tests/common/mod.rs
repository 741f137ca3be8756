#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use framepipe_core::job::{Job, StageOptions};
use framepipe_core::priority::Priority;
use framepipe_core::stages::{StageCatalog, StageName, StagePolicy};
use framepipe_events::EventBus;
use framepipe_pipeline::{PipelineConfig, PipelineExecutor, StageOutcome, StageRequest, StageRunner};
use tempfile::TempDir;
use tokio::sync::Notify;

/// What the fake runner does for a stage.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Write a small output file and report success.
    Succeed,
    /// Report failure with the given reason.
    Fail(String),
    /// Write half an output, then never return.
    Hang,
    /// Report success without writing anything.
    NoOutput,
    /// Signal `gate.reached`, wait for `gate.release`, then succeed.
    Gated(Arc<Gate>),
}

/// Lets a test hold a stage mid-run and inspect the executor meanwhile.
#[derive(Debug, Default)]
pub struct Gate {
    pub reached: Notify,
    pub release: Notify,
}

/// Scripted [`StageRunner`] that records every request it receives.
#[derive(Default)]
pub struct FakeRunner {
    requests: Mutex<Vec<StageRequest>>,
    behaviours: Mutex<HashMap<StageName, Behaviour>>,
}

impl FakeRunner {
    pub fn set(&self, stage: StageName, behaviour: Behaviour) {
        self.behaviours.lock().unwrap().insert(stage, behaviour);
    }

    pub fn calls(&self) -> Vec<StageName> {
        self.requests.lock().unwrap().iter().map(|r| r.stage).collect()
    }

    pub fn requests(&self) -> Vec<StageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl StageRunner for FakeRunner {
    async fn run(&self, request: &StageRequest) -> StageOutcome {
        self.requests.lock().unwrap().push(request.clone());
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(&request.stage)
            .cloned()
            .unwrap_or(Behaviour::Succeed);

        match behaviour {
            Behaviour::Succeed => {
                let body = format!("{} <- {:?}", request.stage, request.inputs);
                tokio::fs::write(&request.output, body).await.unwrap();
                StageOutcome::Complete
            }
            Behaviour::Fail(reason) => StageOutcome::Failed { reason },
            Behaviour::Hang => {
                tokio::fs::write(&request.output, b"partial").await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
                StageOutcome::Complete
            }
            Behaviour::NoOutput => StageOutcome::Complete,
            Behaviour::Gated(gate) => {
                gate.reached.notify_one();
                gate.release.notified().await;
                tokio::fs::write(&request.output, request.stage.as_str())
                    .await
                    .unwrap();
                StageOutcome::Complete
            }
        }
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub runner: Arc<FakeRunner>,
    pub bus: Arc<EventBus>,
    pub executor: PipelineExecutor,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_policy(StagePolicy {
            timeout: Duration::from_secs(10),
            max_retries: 3,
        })
    }

    pub fn with_policy(policy: StagePolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog =
            StageCatalog::with_processing_scripts(Path::new("/app/processing"), "python3", policy);
        let config = PipelineConfig::new(
            dir.path().join("videos"),
            dir.path().join("temp"),
            dir.path().join("cache"),
            catalog,
        );
        let runner = Arc::new(FakeRunner::default());
        let bus = Arc::new(EventBus::default());
        let executor = PipelineExecutor::new(config, runner.clone() as Arc<dyn StageRunner>)
            .with_event_bus(Arc::clone(&bus));

        Self {
            dir,
            runner,
            bus,
            executor,
        }
    }

    /// Write `count` distinct image files and return their paths.
    pub fn images(&self, count: usize) -> Vec<PathBuf> {
        let input_dir = self.dir.path().join("uploads");
        std::fs::create_dir_all(&input_dir).unwrap();
        (0..count)
            .map(|i| {
                let path = input_dir.join(format!("frame_{i:03}.png"));
                std::fs::write(&path, format!("image bytes {i}")).unwrap();
                path
            })
            .collect()
    }

    pub fn job(&self, id: &str, inputs: Vec<PathBuf>, options: StageOptions) -> Job {
        Job::new(id.to_string(), inputs, 24.0, options, Priority::Medium)
    }

    /// Number of entry records in the cache (stored artifact copies excluded).
    pub fn cache_entry_count(&self) -> usize {
        match std::fs::read_dir(self.dir.path().join("cache")) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count(),
            Err(_) => 0,
        }
    }
}

pub fn all_optional() -> StageOptions {
    StageOptions {
        superres: Some("x2".into()),
        denoise: Some(true),
        speech2text: None,
        framerateboost: Some(60.0),
    }
}
