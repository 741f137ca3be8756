//! Stage catalog: the fixed pipeline order and each stage's external
//! command contract.
//!
//! Descriptors are immutable and built once per deployment. Every stage is
//! an opaque executable that reads an input artifact and writes a non-empty
//! file at the output path it is given.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::priority::Priority;

/// Parameters actually used for one stage, keyed by parameter name.
///
/// A `BTreeMap` keeps key order stable for hashing and comparison.
pub type StageParams = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default per-stage wall-clock timeout (1 hour).
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default failure budget per stage.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// StageName
// ---------------------------------------------------------------------------

/// The stages of the pipeline, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    BaseConversion,
    SuperResolution,
    Denoising,
    SpeechToText,
    FramerateBoost,
}

impl StageName {
    /// Every stage in fixed execution order.
    pub const ALL: [StageName; 5] = [
        StageName::BaseConversion,
        StageName::SuperResolution,
        StageName::Denoising,
        StageName::SpeechToText,
        StageName::FramerateBoost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BaseConversion => "base_conversion",
            Self::SuperResolution => "super_resolution",
            Self::Denoising => "denoising",
            Self::SpeechToText => "speech_to_text",
            Self::FramerateBoost => "framerate_boost",
        }
    }

    /// Zero-based position in the fixed order.
    pub fn position(self) -> usize {
        match self {
            Self::BaseConversion => 0,
            Self::SuperResolution => 1,
            Self::Denoising => 2,
            Self::SpeechToText => 3,
            Self::FramerateBoost => 4,
        }
    }

    pub fn is_mandatory(self) -> bool {
        self == Self::BaseConversion
    }

    /// Side-output stages produce an extra artifact and leave the forward
    /// chain untouched.
    pub fn is_side_output(self) -> bool {
        self == Self::SpeechToText
    }

    /// Queue class a standalone invocation of this stage is routed to.
    pub fn default_queue(self) -> Priority {
        match self {
            Self::SpeechToText => Priority::High,
            Self::BaseConversion | Self::Denoising => Priority::Medium,
            Self::SuperResolution | Self::FramerateBoost => Priority::Low,
        }
    }

    /// File extension of the artifact this stage writes.
    pub fn output_extension(self) -> &'static str {
        match self {
            Self::SpeechToText => "txt",
            _ => "mp4",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Command contract
// ---------------------------------------------------------------------------

/// External command template for a stage.
///
/// Argument placeholders:
/// - `{inputs}` expands to one argument per input path,
/// - `{input}` is the single forward input artifact,
/// - `{output}` is the path the stage must write,
/// - `{param:<name>}` is a value from the stage parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    /// Substitute placeholders and return the concrete argument list.
    pub fn render(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        params: &StageParams,
    ) -> Result<Vec<String>, CoreError> {
        let mut rendered = Vec::with_capacity(self.args.len() + inputs.len());

        for arg in &self.args {
            match arg.as_str() {
                "{inputs}" => {
                    rendered.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
                }
                "{input}" => {
                    let input = inputs.first().ok_or_else(|| {
                        CoreError::Validation("stage command needs an input artifact".to_string())
                    })?;
                    rendered.push(input.to_string_lossy().into_owned());
                }
                "{output}" => rendered.push(output.to_string_lossy().into_owned()),
                other => match other
                    .strip_prefix("{param:")
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(name) => {
                        let value = params.get(name).ok_or_else(|| {
                            CoreError::Validation(format!("missing stage parameter '{name}'"))
                        })?;
                        rendered.push(render_value(value));
                    }
                    None => rendered.push(other.to_string()),
                },
            }
        }

        Ok(rendered)
    }
}

/// Render a parameter value as a command-line argument.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Timeout and failure budget applied to each invocation of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STAGE_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptor and catalog
// ---------------------------------------------------------------------------

/// Immutable description of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub stage: StageName,
    pub mandatory: bool,
    pub position: usize,
    pub command: CommandTemplate,
    pub policy: StagePolicy,
}

impl StageDescriptor {
    /// Job-qualified file name of the artifact this stage produces.
    pub fn output_file_name(&self, job_id: &str) -> String {
        format!(
            "{job_id}_{}.{}",
            self.stage.as_str(),
            self.stage.output_extension()
        )
    }
}

/// All stage descriptors of a deployment, indexed by stage.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    descriptors: BTreeMap<StageName, StageDescriptor>,
}

impl StageCatalog {
    /// Build a catalog from explicit descriptors.
    ///
    /// Every stage must be described exactly once.
    pub fn new(descriptors: Vec<StageDescriptor>) -> Result<Self, CoreError> {
        let mut map = BTreeMap::new();
        for descriptor in descriptors {
            let stage = descriptor.stage;
            if map.insert(stage, descriptor).is_some() {
                return Err(CoreError::Validation(format!(
                    "stage '{stage}' described more than once"
                )));
            }
        }
        if let Some(missing) = StageName::ALL.iter().find(|s| !map.contains_key(s)) {
            return Err(CoreError::Validation(format!(
                "stage '{missing}' has no descriptor"
            )));
        }
        Ok(Self { descriptors: map })
    }

    /// Catalog invoking the stock processing scripts through `python_bin`.
    pub fn with_processing_scripts(
        processing_dir: &Path,
        python_bin: &str,
        policy: StagePolicy,
    ) -> Self {
        let script = |name: &str| processing_dir.join(name).to_string_lossy().into_owned();
        let descriptor = |stage: StageName, script_name: &str, args: &[&str]| {
            let mut full_args = vec![script(script_name)];
            full_args.extend(args.iter().map(|a| a.to_string()));
            StageDescriptor {
                stage,
                mandatory: stage.is_mandatory(),
                position: stage.position(),
                command: CommandTemplate {
                    program: python_bin.to_string(),
                    args: full_args,
                },
                policy,
            }
        };

        let descriptors = [
            descriptor(
                StageName::BaseConversion,
                "image_to_video.py",
                &["--input", "{inputs}", "--fps", "{param:fps}", "--output", "{output}"],
            ),
            descriptor(
                StageName::SuperResolution,
                "super_resolution.py",
                &[
                    "--input",
                    "{input}",
                    "--output",
                    "{output}",
                    "--resolution",
                    "{param:resolution}",
                ],
            ),
            descriptor(
                StageName::Denoising,
                "denoise.py",
                &[
                    "--input",
                    "{input}",
                    "--output",
                    "{output}",
                    "--temporal-strength",
                    "{param:temporal_strength}",
                    "--spatial-strength",
                    "{param:spatial_strength}",
                ],
            ),
            descriptor(
                StageName::SpeechToText,
                "speech_to_text.py",
                &["--input", "{input}", "--output", "{output}", "--model", "{param:model}"],
            ),
            descriptor(
                StageName::FramerateBoost,
                "framerate_boost.py",
                &["--input", "{input}", "--output", "{output}", "--fps", "{param:target_fps}"],
            ),
        ];

        Self {
            descriptors: descriptors.into_iter().map(|d| (d.stage, d)).collect(),
        }
    }

    pub fn get(&self, stage: StageName) -> &StageDescriptor {
        // `new` and `with_processing_scripts` guarantee every stage is present.
        &self.descriptors[&stage]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.descriptors.values()
    }
}
