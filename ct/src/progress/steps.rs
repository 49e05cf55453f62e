//! Step tracking
//!
//! Normalizes server-reported step updates into an ordered step list.
//! Steps appear in discovery order (first server report wins) and are
//! never reordered or removed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::StepUpdate;

/// One named processing phase of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStep {
    /// Step name, unique within a job
    pub name: String,
    /// Whether the step has finished
    pub completed: bool,
    /// Server's estimate for this step, in seconds
    pub estimated_seconds: Option<f64>,
    /// Measured duration once the step finished
    pub actual_seconds: Option<f64>,
}

/// Presentation classification of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Step finished
    Completed,
    /// Step currently in progress
    Active,
    /// Step not started yet
    Pending,
}

/// Merge one wire update into the step list
///
/// A known step is merged field-by-field: `completed` latches forward,
/// a previously known `estimated_seconds` is kept when the update omits
/// it. An unknown step is appended at the end, preserving the order the
/// server first reported it.
pub fn apply_step_update(steps: &mut Vec<ProcessingStep>, update: &StepUpdate) {
    if let Some(existing) = steps.iter_mut().find(|s| s.name == update.step) {
        debug!(step = %update.step, completed = update.completed, "apply_step_update: merging known step");
        existing.completed = existing.completed || update.completed;
        if update.estimated_seconds.is_some() {
            existing.estimated_seconds = update.estimated_seconds;
        }
        if update.actual_seconds.is_some() {
            existing.actual_seconds = update.actual_seconds;
        }
        return;
    }

    debug!(step = %update.step, "apply_step_update: appending new step");
    steps.push(ProcessingStep {
        name: update.step.clone(),
        completed: update.completed,
        estimated_seconds: update.estimated_seconds,
        actual_seconds: update.actual_seconds,
    });
}

/// Aggregate completion across all known steps, as a percentage
///
/// Returns 0 when no steps have been reported yet.
pub fn overall_completion(steps: &[ProcessingStep]) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let completed = steps.iter().filter(|s| s.completed).count();
    100.0 * completed as f64 / steps.len() as f64
}

/// Classify a step for display
pub fn classify(step: &ProcessingStep, current_step: &str) -> StepPhase {
    if step.completed {
        StepPhase::Completed
    } else if step.name == current_step {
        StepPhase::Active
    } else {
        StepPhase::Pending
    }
}
