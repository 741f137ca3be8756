//! In-process event bus for pipeline observers.
//!
//! - [`EventBus`]: publish/subscribe hub backed by `tokio::sync::broadcast`.
//! - [`PipelineEvent`]: the event envelope for progress reports, stage
//!   transitions and resource warnings.

pub mod bus;

pub use bus::{event_types, EventBus, PipelineEvent};
