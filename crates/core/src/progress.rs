//! Per-job progress and ETA tracking.
//!
//! Progress is derived, never persisted. A resumed job builds a fresh
//! tracker seeded with the number of stages its checkpoint already covers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Snapshot published after every stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Completion percentage in `0.0..=100.0`.
    pub percent: f64,
    pub steps_done: u32,
    pub steps_total: u32,
    /// Estimated seconds until the last stage finishes; `0.0` before any
    /// stage has completed in this run.
    pub estimated_seconds_remaining: f64,
    /// Short human-readable note about the latest transition.
    pub status: String,
}

/// Total stage count for a job: the mandatory base stage plus every
/// requested optional stage.
pub fn total_stages(optional_stage_count: usize) -> u32 {
    1 + optional_stage_count as u32
}

/// Converts stage completions into percentage and ETA.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    steps_total: u32,
    steps_done: u32,
    /// Steps already complete when this tracker was created. They took no
    /// time in this run, so they are excluded from the per-step rate.
    baseline: u32,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total_stages: u32) -> Self {
        Self::resumed(total_stages, 0)
    }

    /// Tracker for a job resuming with `already_done` stages checkpointed.
    pub fn resumed(total_stages: u32, already_done: u32) -> Self {
        let steps_total = total_stages.max(1);
        let steps_done = already_done.min(steps_total);
        Self {
            steps_total,
            steps_done,
            baseline: steps_done,
            started: Instant::now(),
        }
    }

    pub fn steps_done(&self) -> u32 {
        self.steps_done
    }

    pub fn steps_total(&self) -> u32 {
        self.steps_total
    }

    /// Report the current state without advancing.
    pub fn report(&self, status: impl Into<String>) -> ProgressReport {
        self.report_with_elapsed(self.started.elapsed(), status.into())
    }

    /// Mark `steps` more stages as complete.
    pub fn advance(&mut self, steps: u32) -> ProgressReport {
        self.advance_with_status(steps, "")
    }

    /// Mark `steps` more stages as complete, attaching a status note.
    ///
    /// The done count never exceeds the total, so percent never passes 100.
    pub fn advance_with_status(&mut self, steps: u32, status: impl Into<String>) -> ProgressReport {
        self.steps_done = self.steps_done.saturating_add(steps).min(self.steps_total);
        self.report(status)
    }

    fn report_with_elapsed(&self, elapsed: Duration, status: String) -> ProgressReport {
        let percent = f64::from(self.steps_done) / f64::from(self.steps_total) * 100.0;
        let done_this_run = self.steps_done - self.baseline;
        let estimated_seconds_remaining = if done_this_run == 0 {
            0.0
        } else {
            let per_step = elapsed.as_secs_f64() / f64::from(done_this_run);
            per_step * f64::from(self.steps_total - self.steps_done)
        };

        ProgressReport {
            percent,
            steps_done: self.steps_done,
            steps_total: self.steps_total,
            estimated_seconds_remaining,
            status,
        }
    }
}
