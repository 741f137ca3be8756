//! Resource samples and threshold evaluation.
//!
//! Pure logic. Sampling happens in `framepipe-monitor`; this module only
//! judges and summarises the samples it is handed.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Default warning threshold for every metric, in percent.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 90.0;

/// One point-in-time snapshot of host utilisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: Timestamp,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// `None` on hosts without a visible GPU.
    pub gpu_util_percent: Option<f64>,
    pub gpu_memory_percent: Option<f64>,
    /// `None` when the sampled mount could not be read.
    pub disk_percent: Option<f64>,
}

impl ResourceSample {
    /// Value of a single metric, if the sample carries it.
    pub fn value(&self, metric: ResourceMetric) -> Option<f64> {
        match metric {
            ResourceMetric::Cpu => Some(self.cpu_percent),
            ResourceMetric::Memory => Some(self.memory_percent),
            ResourceMetric::GpuUtilization => self.gpu_util_percent,
            ResourceMetric::GpuMemory => self.gpu_memory_percent,
            ResourceMetric::Disk => self.disk_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMetric {
    Cpu,
    Memory,
    GpuUtilization,
    GpuMemory,
    Disk,
}

impl ResourceMetric {
    pub const ALL: [ResourceMetric; 5] = [
        ResourceMetric::Cpu,
        ResourceMetric::Memory,
        ResourceMetric::GpuUtilization,
        ResourceMetric::GpuMemory,
        ResourceMetric::Disk,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU usage",
            Self::Memory => "Memory usage",
            Self::GpuUtilization => "GPU utilization",
            Self::GpuMemory => "GPU memory usage",
            Self::Disk => "Disk usage",
        }
    }
}

/// Per-metric warning thresholds in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_util_percent: f64,
    pub gpu_memory_percent: f64,
    pub disk_percent: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: DEFAULT_THRESHOLD_PERCENT,
            memory_percent: DEFAULT_THRESHOLD_PERCENT,
            gpu_util_percent: DEFAULT_THRESHOLD_PERCENT,
            gpu_memory_percent: DEFAULT_THRESHOLD_PERCENT,
            disk_percent: DEFAULT_THRESHOLD_PERCENT,
        }
    }
}

impl ResourceThresholds {
    pub fn for_metric(&self, metric: ResourceMetric) -> f64 {
        match metric {
            ResourceMetric::Cpu => self.cpu_percent,
            ResourceMetric::Memory => self.memory_percent,
            ResourceMetric::GpuUtilization => self.gpu_util_percent,
            ResourceMetric::GpuMemory => self.gpu_memory_percent,
            ResourceMetric::Disk => self.disk_percent,
        }
    }
}

/// Advisory warning for one metric above its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceWarning {
    pub metric: ResourceMetric,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: Timestamp,
}

impl std::fmt::Display for ResourceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} critical: {:.1}% (threshold {:.1}%)",
            self.metric.label(),
            self.value,
            self.threshold
        )
    }
}

/// Return one warning per metric strictly above its threshold.
///
/// Metrics the sample does not carry are skipped.
pub fn check_thresholds(
    sample: &ResourceSample,
    thresholds: &ResourceThresholds,
) -> Vec<ResourceWarning> {
    ResourceMetric::ALL
        .into_iter()
        .filter_map(|metric| {
            let value = sample.value(metric)?;
            let threshold = thresholds.for_metric(metric);
            (value > threshold).then(|| ResourceWarning {
                metric,
                value,
                threshold,
                timestamp: sample.timestamp,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Averages
// ---------------------------------------------------------------------------

/// Mean utilisation over a set of samples.
///
/// Optional metrics average only the samples that carried them and stay
/// `None` when none did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageStats {
    pub sample_count: usize,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_util_percent: Option<f64>,
    pub gpu_memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

/// Average the given samples, or `None` if there are none.
pub fn average<'a>(samples: impl IntoIterator<Item = &'a ResourceSample>) -> Option<AverageStats> {
    let samples: Vec<&ResourceSample> = samples.into_iter().collect();
    if samples.is_empty() {
        return None;
    }

    let mean = |metric: ResourceMetric| -> Option<f64> {
        let values: Vec<f64> = samples.iter().filter_map(|s| s.value(metric)).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };

    Some(AverageStats {
        sample_count: samples.len(),
        cpu_percent: mean(ResourceMetric::Cpu).unwrap_or_default(),
        memory_percent: mean(ResourceMetric::Memory).unwrap_or_default(),
        gpu_util_percent: mean(ResourceMetric::GpuUtilization),
        gpu_memory_percent: mean(ResourceMetric::GpuMemory),
        disk_percent: mean(ResourceMetric::Disk),
    })
}
