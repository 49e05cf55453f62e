//! Progress derivation helpers
//!
//! Pure functions that turn raw step reports and elapsed time into the
//! numbers the presentation layer shows: completion percentages, remaining
//! time, and processing rates. Nothing here holds state; everything is
//! computed from a `ProgressState` snapshot on read.

mod estimate;
mod steps;

pub use estimate::{elapsed_seconds, format_duration, processing_rate, remaining_seconds};
pub use steps::{ProcessingStep, StepPhase, apply_step_update, classify, overall_completion};
