//! Priority classification for work-queue routing.
//!
//! The classifier only labels a job; queue admission and routing belong to
//! whatever scheduler consumes the label.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Size thresholds
// ---------------------------------------------------------------------------

/// Inputs at or above this size are demoted to `Low` (1 GB).
pub const LARGE_INPUT_BYTES: u64 = 1_000_000_000;

/// Inputs below this size are promoted to `High` (10 MB).
pub const SMALL_INPUT_BYTES: u64 = 10_000_000;

/// Requesting more than this many optional stages demotes the job one level.
pub const COMPLEX_STAGE_COUNT: usize = 2;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Coarse priority class used to pick a work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Routing key of the queue serving this class.
    pub fn queue_name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// One level lower, with `Low` as the floor.
    pub fn demoted(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Classify a job from its total input size and number of optional stages.
///
/// Starts at `Medium`, moves to `Low` for large inputs or `High` for small
/// ones, then demotes one level when more than [`COMPLEX_STAGE_COUNT`]
/// optional stages were requested.
pub fn classify(input_size_bytes: u64, optional_stage_count: usize) -> Priority {
    let mut priority = if input_size_bytes >= LARGE_INPUT_BYTES {
        Priority::Low
    } else if input_size_bytes < SMALL_INPUT_BYTES {
        Priority::High
    } else {
        Priority::Medium
    };

    if optional_stage_count > COMPLEX_STAGE_COUNT {
        priority = priority.demoted();
    }

    priority
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    #[test]
    fn small_input_without_options_is_high() {
        assert_eq!(classify(5 * MB, 0), Priority::High);
    }

    #[test]
    fn large_input_with_many_options_stays_low() {
        assert_eq!(classify(2_000 * MB, 3), Priority::Low);
    }

    #[test]
    fn mid_sized_input_is_medium() {
        assert_eq!(classify(500 * MB, 2), Priority::Medium);
    }

    #[test]
    fn exactly_one_gigabyte_is_low() {
        assert_eq!(classify(LARGE_INPUT_BYTES, 0), Priority::Low);
    }

    #[test]
    fn exactly_ten_megabytes_is_medium() {
        assert_eq!(classify(SMALL_INPUT_BYTES, 0), Priority::Medium);
    }

    #[test]
    fn many_options_demote_high_to_medium() {
        assert_eq!(classify(MB, 3), Priority::Medium);
    }

    #[test]
    fn many_options_demote_medium_to_low() {
        assert_eq!(classify(100 * MB, 4), Priority::Low);
    }

    #[test]
    fn two_options_do_not_demote() {
        assert_eq!(classify(MB, 2), Priority::High);
    }

    #[test]
    fn queue_names() {
        assert_eq!(Priority::High.queue_name(), "high");
        assert_eq!(Priority::Medium.to_string(), "medium");
        assert_eq!(Priority::Low.queue_name(), "low");
    }
}
