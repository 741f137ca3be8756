//! Host metrics collection.
//!
//! [`SystemCollector`] reads CPU and memory through `sysinfo`, GPU
//! utilisation and memory through NVML, and disk usage through `statvfs`.
//!
//! NVML initialisation is **gracefully optional**: if the host has no
//! NVIDIA drivers the collector logs a warning and samples carry no GPU
//! metrics instead of failing.

use std::path::{Path, PathBuf};

use chrono::Utc;
use framepipe_core::resources::ResourceSample;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Failure of a single metric probe.
///
/// Probe failures never abort a sample; the affected metric is left empty.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("NVML error: {0}")]
    Nvml(#[from] NvmlError),

    #[error("Disk usage unavailable for {path}: {source}")]
    Disk {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can produce a [`ResourceSample`] on demand.
///
/// Sampling is synchronous and may block briefly; the monitor calls it
/// from a blocking task.
pub trait SampleSource: Send + 'static {
    fn sample(&mut self) -> ResourceSample;
}

/// Per-GPU snapshot collected from NVML.
#[derive(Debug, Clone, Serialize)]
pub struct GpuMetrics {
    pub gpu_index: u32,
    pub vram_used_mb: u64,
    pub vram_total_mb: u64,
    pub utilization_percent: u32,
}

impl GpuMetrics {
    pub fn memory_percent(&self) -> f64 {
        if self.vram_total_mb == 0 {
            0.0
        } else {
            self.vram_used_mb as f64 / self.vram_total_mb as f64 * 100.0
        }
    }
}

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Collects samples for the local host.
pub struct SystemCollector {
    system: System,
    /// `None` when NVML could not be initialised (no drivers / no GPU).
    nvml: Option<Nvml>,
    disk_path: PathBuf,
}

impl SystemCollector {
    /// Create a collector sampling disk usage of the mount holding `disk_path`.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!("NVML initialised successfully");
                Some(nvml)
            }
            Err(e) => {
                tracing::warn!(error = %e, "NVML unavailable -- GPU metrics will not be collected");
                None
            }
        };

        Self {
            system: System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            ),
            nvml,
            disk_path: disk_path.into(),
        }
    }

    /// Number of GPUs visible to NVML, or 0 if NVML is unavailable.
    pub fn gpu_count(&self) -> u32 {
        self.nvml
            .as_ref()
            .and_then(|nvml| nvml.device_count().ok())
            .unwrap_or(0)
    }

    /// Collect a metrics snapshot for every GPU on the host.
    ///
    /// Errors on individual devices are logged and the device is skipped
    /// rather than failing the entire collection pass.
    pub fn collect_gpus(&self) -> Vec<GpuMetrics> {
        let Some(nvml) = self.nvml.as_ref() else {
            return Vec::new();
        };

        let device_count = match nvml.device_count() {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query GPU device count");
                return Vec::new();
            }
        };

        let mut metrics = Vec::with_capacity(device_count as usize);
        for idx in 0..device_count {
            match collect_device(nvml, idx) {
                Ok(m) => metrics.push(m),
                Err(e) => {
                    tracing::warn!(gpu_index = idx, error = %e, "Skipping GPU -- metrics collection failed");
                }
            }
        }
        metrics
    }

    fn cpu_and_memory(&mut self) -> (f64, f64) {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let cpu = f64::from(self.system.global_cpu_usage());
        let total_mem = self.system.total_memory();
        let used_mem = self.system.used_memory();
        let mem = if total_mem > 0 {
            used_mem as f64 / total_mem as f64 * 100.0
        } else {
            0.0
        };
        (cpu, mem)
    }
}

impl SampleSource for SystemCollector {
    fn sample(&mut self) -> ResourceSample {
        let (cpu_percent, memory_percent) = self.cpu_and_memory();

        // With several GPUs, report the busiest one.
        let gpus = self.collect_gpus();
        let gpu_util_percent = gpus
            .iter()
            .map(|g| f64::from(g.utilization_percent))
            .reduce(f64::max);
        let gpu_memory_percent = gpus.iter().map(GpuMetrics::memory_percent).reduce(f64::max);

        ResourceSample {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            gpu_util_percent,
            gpu_memory_percent,
            disk_percent: match disk_usage_percent(&self.disk_path) {
                Ok(pct) => Some(pct),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping disk metric");
                    None
                }
            },
        }
    }
}

/// Collect metrics for a single GPU device.
fn collect_device(nvml: &Nvml, idx: u32) -> Result<GpuMetrics, CollectorError> {
    let device = nvml.device_by_index(idx)?;
    let mem_info = device.memory_info()?;
    let utilization = device.utilization_rates()?;

    Ok(GpuMetrics {
        gpu_index: idx,
        vram_used_mb: mem_info.used / BYTES_PER_MB,
        vram_total_mb: mem_info.total / BYTES_PER_MB,
        utilization_percent: utilization.gpu,
    })
}

/// Used space of the filesystem holding `path`, in percent.
pub fn disk_usage_percent(path: &Path) -> Result<f64, CollectorError> {
    let disk_error = |source: std::io::Error| CollectorError::Disk {
        path: path.display().to_string(),
        source,
    };

    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
            disk_error(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();

        // Safety: `c_path` is a valid NUL-terminated string and `stat` is
        // only read after statvfs reports success.
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret != 0 {
            return Err(disk_error(std::io::Error::last_os_error()));
        }
        let stat = unsafe { stat.assume_init() };

        let block_size = stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * block_size;
        let free = stat.f_bavail as u64 * block_size;
        if total == 0 {
            return Err(disk_error(std::io::Error::other("filesystem reports zero blocks")));
        }
        let used = total.saturating_sub(free);
        Ok(used as f64 / total as f64 * 100.0)
    }

    #[cfg(not(unix))]
    {
        Err(disk_error(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "statvfs is only available on unix",
        )))
    }
}
