//! Worker process for the frame pipeline: environment configuration,
//! admission and the wiring that runs a job.

pub mod admission;
pub mod config;
pub mod service;

pub use config::{LogFormat, WorkerConfig};
pub use service::Worker;
