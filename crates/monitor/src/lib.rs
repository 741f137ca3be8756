//! Host resource monitoring.
//!
//! - [`collector`] gathers CPU, memory, GPU and disk utilisation.
//! - [`monitor`] runs the background sampling loop with a bounded history
//!   and threshold warnings.

pub mod collector;
pub mod monitor;

pub use collector::{CollectorError, SampleSource, SystemCollector};
pub use monitor::{MonitorConfig, MonitorError, MonitorHandle, ResourceMonitor};
