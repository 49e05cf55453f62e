//! Time estimation for in-flight jobs
//!
//! All functions are pure; callers pass the clock in. Estimates degrade
//! gracefully: with no step estimates the remaining time is 0, never
//! negative or NaN.

use tracing::debug;

use super::steps::ProcessingStep;
use crate::domain::CitationInfo;

/// Seconds elapsed since the job started
///
/// Clocks can disagree; a start timestamp in the future floors to 0.
pub fn elapsed_seconds(started_at_epoch_ms: u64, now_epoch_ms: u64) -> f64 {
    now_epoch_ms.saturating_sub(started_at_epoch_ms) as f64 / 1000.0
}

/// Estimated seconds remaining, derived from per-step estimates
///
/// Sums `estimated_seconds` over all uncompleted steps, then subtracts the
/// elapsed time already spent inside the current step. Returns 0 when no
/// estimates exist or the estimate is exhausted.
pub fn remaining_seconds(steps: &[ProcessingStep], current_step: &str, elapsed: f64) -> f64 {
    let completed_estimate: f64 = steps
        .iter()
        .filter(|s| s.completed)
        .filter_map(|s| s.estimated_seconds)
        .sum();
    let pending_estimate: f64 = steps
        .iter()
        .filter(|s| !s.completed)
        .filter_map(|s| s.estimated_seconds)
        .sum();

    if pending_estimate <= 0.0 {
        debug!(%current_step, "remaining_seconds: no pending estimates");
        return 0.0;
    }

    // Time already spent in the current step is elapsed time not accounted
    // for by the steps that finished before it.
    let spent_in_current = (elapsed - completed_estimate).max(0.0);
    (pending_estimate - spent_in_current).max(0.0)
}

/// Render a duration as `"Xm Ys"` above a minute, else `"Ys"`
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    if total >= 60 {
        format!("{}m {}s", total / 60, total % 60)
    } else {
        format!("{}s", total)
    }
}

/// Citations processed per minute, rounded for display
///
/// Returns 0 when nothing has been processed yet or no time has elapsed.
pub fn processing_rate(citations: Option<&CitationInfo>, elapsed_seconds: f64) -> u32 {
    let Some(info) = citations else {
        return 0;
    };
    if elapsed_seconds <= 0.0 || info.processed == 0 {
        return 0;
    }
    (f64::from(info.processed) / elapsed_seconds * 60.0).round() as u32
}
