use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use framepipe_core::job::DEFAULT_MAX_FILE_SIZE_MB;
use framepipe_core::resources::{ResourceThresholds, DEFAULT_THRESHOLD_PERCENT};
use framepipe_core::stages::{StageCatalog, StagePolicy, DEFAULT_MAX_RETRIES, DEFAULT_STAGE_TIMEOUT};
use framepipe_monitor::monitor::{DEFAULT_INTERVAL, DEFAULT_MAX_HISTORY};
use framepipe_monitor::MonitorConfig;
use framepipe_pipeline::PipelineConfig;

/// Log output format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Worker configuration loaded from environment variables.
///
/// Every field has a default matching the container layout. Invalid
/// numeric values are logged and replaced by the default.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub output_dir: PathBuf,
    /// Root of per-job intermediates; checkpoints go in `checkpoints/` below it.
    pub temp_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Directory holding the stage scripts.
    pub processing_dir: PathBuf,
    pub python_bin: String,
    pub task_timeout_secs: u64,
    pub max_retries: u32,
    pub max_file_size_mb: u64,
    pub monitor_interval_secs: u64,
    pub monitor_max_history: usize,
    pub monitor_disk_path: PathBuf,
    pub thresholds: ResourceThresholds,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default            |
    /// |-------------------------|--------------------|
    /// | `OUTPUT_DIR`            | `/app/videos`      |
    /// | `TEMP_DIR`              | `/app/temp`        |
    /// | `CACHE_DIR`             | `/app/cache`       |
    /// | `PROCESSING_DIR`        | `/app/processing`  |
    /// | `PYTHON_BIN`            | `python3`          |
    /// | `TASK_TIMEOUT`          | `3600`             |
    /// | `MAX_RETRIES`           | `3`                |
    /// | `MAX_FILE_SIZE_MB`      | `100`              |
    /// | `MONITOR_INTERVAL_SECS` | `5`                |
    /// | `MONITOR_MAX_HISTORY`   | `100`              |
    /// | `MONITOR_DISK_PATH`     | `/`                |
    /// | `*_THRESHOLD`           | `90`               |
    /// | `LOG_FORMAT`            | `text`             |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.into());
        let threshold = |name: &str| parse_or(&lookup, name, DEFAULT_THRESHOLD_PERCENT);

        Self {
            output_dir: string("OUTPUT_DIR", "/app/videos").into(),
            temp_dir: string("TEMP_DIR", "/app/temp").into(),
            cache_dir: string("CACHE_DIR", "/app/cache").into(),
            processing_dir: string("PROCESSING_DIR", "/app/processing").into(),
            python_bin: string("PYTHON_BIN", "python3"),
            task_timeout_secs: parse_or(&lookup, "TASK_TIMEOUT", DEFAULT_STAGE_TIMEOUT.as_secs()),
            max_retries: parse_or(&lookup, "MAX_RETRIES", DEFAULT_MAX_RETRIES),
            max_file_size_mb: parse_or(&lookup, "MAX_FILE_SIZE_MB", DEFAULT_MAX_FILE_SIZE_MB),
            monitor_interval_secs: parse_or(
                &lookup,
                "MONITOR_INTERVAL_SECS",
                DEFAULT_INTERVAL.as_secs(),
            ),
            monitor_max_history: parse_or(&lookup, "MONITOR_MAX_HISTORY", DEFAULT_MAX_HISTORY),
            monitor_disk_path: string("MONITOR_DISK_PATH", "/").into(),
            thresholds: ResourceThresholds {
                cpu_percent: threshold("CPU_THRESHOLD"),
                memory_percent: threshold("MEMORY_THRESHOLD"),
                gpu_util_percent: threshold("GPU_UTIL_THRESHOLD"),
                gpu_memory_percent: threshold("GPU_MEMORY_THRESHOLD"),
                disk_percent: threshold("DISK_THRESHOLD"),
            },
            log_format: LogFormat::parse(lookup("LOG_FORMAT").as_deref()),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn stage_policy(&self) -> StagePolicy {
        StagePolicy {
            timeout: Duration::from_secs(self.task_timeout_secs.max(1)),
            max_retries: self.max_retries,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(
            &self.output_dir,
            &self.temp_dir,
            &self.cache_dir,
            StageCatalog::with_processing_scripts(
                &self.processing_dir,
                &self.python_bin,
                self.stage_policy(),
            ),
        )
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            max_history: self.monitor_max_history.max(1),
            thresholds: self.thresholds,
        }
    }
}

/// Parse `name` as `T`, falling back to `default` when unset or invalid.
fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    variable = name,
                    value = %raw,
                    default = %default,
                    "Invalid configuration value, using default"
                );
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> WorkerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_container_layout() {
        let cfg = config(&[]);
        assert_eq!(cfg.output_dir, PathBuf::from("/app/videos"));
        assert_eq!(cfg.temp_dir, PathBuf::from("/app/temp"));
        assert_eq!(cfg.task_timeout_secs, 3600);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_file_size_bytes(), 100 * 1024 * 1024);
        assert_eq!(cfg.thresholds, ResourceThresholds::default());
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(
            cfg.pipeline_config().checkpoint_dir,
            PathBuf::from("/app/temp/checkpoints")
        );
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("TASK_TIMEOUT", "120"),
            ("MAX_RETRIES", "5"),
            ("CPU_THRESHOLD", "75.5"),
            ("MONITOR_INTERVAL_SECS", "2"),
            ("LOG_FORMAT", "JSON"),
        ]);
        assert_eq!(cfg.stage_policy().timeout, Duration::from_secs(120));
        assert_eq!(cfg.stage_policy().max_retries, 5);
        assert_eq!(cfg.thresholds.cpu_percent, 75.5);
        assert_eq!(cfg.monitor_config().interval, Duration::from_secs(2));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn log_format_accepts_json_in_any_case_and_defaults_to_text() {
        assert_eq!(config(&[("LOG_FORMAT", " Json ")]).log_format, LogFormat::Json);
        assert_eq!(config(&[("LOG_FORMAT", "pretty")]).log_format, LogFormat::Text);
        assert_eq!(config(&[("LOG_FORMAT", "")]).log_format, LogFormat::Text);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let cfg = config(&[("TASK_TIMEOUT", "soon"), ("MAX_RETRIES", "-1")]);
        assert_eq!(cfg.task_timeout_secs, 3600);
        assert_eq!(cfg.max_retries, 3);
    }
}
