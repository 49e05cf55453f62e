//! Presentation read model and facade
//!
//! [`ProgressView`] is a pure function of a `ProgressState` snapshot:
//! recomputed on every read, holding no mutable state of its own.
//! [`ProgressFacade`] is the surface presentation layers talk to - derived
//! values plus retry/cancel/reset actions that report success as booleans
//! and never raise for ordinary "nothing to do" conditions.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::channel::{JobTransport, TaskChannel};
use crate::config::ChannelConfig;
use crate::domain::{CitationInfo, JobStatus, UploadRequest, now_ms};
use crate::progress::{
    StepPhase, classify, elapsed_seconds, format_duration, overall_completion, processing_rate, remaining_seconds,
};
use crate::state::{Applied, JobEvent, ProgressChanged, ProgressHandle, ProgressState};

/// Weight of step completion in the blended progress percentage
const STEP_WEIGHT: f64 = 0.7;

/// Weight of citation completion in the blended progress percentage
const CITATION_WEIGHT: f64 = 0.3;

/// Visual style for the progress bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarClass {
    /// Job in flight
    Info,
    /// Job completed
    Success,
    /// Job failed (bar fills in error color)
    Danger,
}

/// One step as shown to the user
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    /// Step name
    pub name: String,
    /// Display classification
    pub phase: StepPhase,
    /// Server estimate, seconds
    pub estimated_seconds: Option<f64>,
    /// Measured duration, seconds
    pub actual_seconds: Option<f64>,
}

/// Derived presentation values for one snapshot
///
/// No raw transport objects leak upward; everything here is ready to
/// render.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    /// Lifecycle status
    pub status: JobStatus,
    /// Whether the progress surface should be visible at all
    pub show_progress: bool,
    /// Blended completion percentage, 0..=100
    pub percent: f64,
    /// Progress bar styling
    pub bar_class: BarClass,
    /// Step currently in progress; empty when not running
    pub current_step: String,
    /// Steps in server discovery order with classification
    pub steps: Vec<StepView>,
    /// Formatted elapsed time ("Xm Ys")
    pub elapsed: String,
    /// Formatted estimated remaining time
    pub remaining: String,
    /// Citation counts, once known
    pub citations: Option<CitationInfo>,
    /// Citations verified per minute
    pub rate_per_minute: u32,
    /// Rate-limit summary line, when the server reported one
    pub rate_limit_summary: Option<String>,
    /// Failure message, present iff failed
    pub error: Option<String>,
    /// Whether a retry action is offered
    pub can_retry: bool,
}

impl ProgressView {
    /// Derive the full view from one immutable state snapshot
    pub fn from_state(state: &ProgressState, now_epoch_ms: u64) -> Self {
        let step_completion = overall_completion(&state.steps);
        let citation_completion = state.citations.map(|c| c.completion() * 100.0).unwrap_or(0.0);

        // Terminal jobs fill the bar completely; failures render it in
        // the error color instead of leaving it partially filled.
        let percent = if state.has_results() || state.error.is_some() {
            100.0
        } else {
            (STEP_WEIGHT * step_completion + CITATION_WEIGHT * citation_completion).clamp(0.0, 100.0)
        };

        let bar_class = if state.error.is_some() {
            BarClass::Danger
        } else if state.has_results() {
            BarClass::Success
        } else {
            BarClass::Info
        };

        let elapsed_secs = state
            .started_at_epoch_ms
            .map(|started| elapsed_seconds(started, now_epoch_ms))
            .unwrap_or(0.0);
        let remaining_secs = remaining_seconds(&state.steps, &state.current_step, elapsed_secs);

        let steps = state
            .steps
            .iter()
            .map(|step| StepView {
                name: step.name.clone(),
                phase: classify(step, &state.current_step),
                estimated_seconds: step.estimated_seconds,
                actual_seconds: step.actual_seconds,
            })
            .collect();

        Self {
            status: state.status,
            show_progress: state.status != JobStatus::Idle,
            percent,
            bar_class,
            current_step: state.current_step.clone(),
            steps,
            elapsed: format_duration(elapsed_secs),
            remaining: format_duration(remaining_secs),
            citations: state.citations,
            rate_per_minute: processing_rate(state.citations.as_ref(), elapsed_secs),
            rate_limit_summary: state.rate_limit.map(|rl| rl.summary()),
            error: state.error.clone(),
            can_retry: state.can_retry,
        }
    }
}

/// The subscription surface presentation layers use
///
/// Owns the state actor handle and the task channel; constructed once per
/// tracker and shared by reference with whichever layer needs it.
pub struct ProgressFacade {
    handle: ProgressHandle,
    channel: Arc<TaskChannel>,
}

impl ProgressFacade {
    /// Build a facade over the given transport
    pub fn new(transport: Arc<dyn JobTransport>, config: ChannelConfig) -> Self {
        debug!("ProgressFacade::new: called");
        let handle = ProgressHandle::spawn();
        let channel = Arc::new(TaskChannel::new(transport, handle.clone(), config));
        Self { handle, channel }
    }

    /// Handle to the underlying state actor (for advanced observers)
    pub fn handle(&self) -> &ProgressHandle {
        &self.handle
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressChanged> {
        self.handle.subscribe_changes()
    }

    /// Start tracking a new verification job
    ///
    /// Returns false when the payload is empty (validation never enters
    /// the state machine) or another job is already active.
    pub async fn start(&self, upload: UploadRequest) -> bool {
        debug!(upload_type = %upload.upload_type, "ProgressFacade::start: called");
        if !upload.is_valid() {
            warn!("start: empty payload rejected");
            return false;
        }

        match self
            .handle
            .apply(JobEvent::JobStarted {
                upload: upload.clone(),
            })
            .await
        {
            Ok(Applied::Applied) => {}
            Ok(_) => {
                warn!("start: a job is already active; cancel or reset first");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "start: state actor unreachable");
                return false;
            }
        }

        self.channel.start(upload).await.is_ok()
    }

    /// Replay the failed job's stored input
    ///
    /// Returns false when there is nothing retryable; never raises.
    pub async fn retry(&self) -> bool {
        debug!("ProgressFacade::retry: called");
        let Ok(snapshot) = self.handle.snapshot().await else {
            return false;
        };
        if snapshot.status != JobStatus::Failed || !snapshot.can_retry {
            debug!(status = %snapshot.status, can_retry = snapshot.can_retry, "retry: nothing to retry");
            return false;
        }
        let Some(upload) = snapshot.upload else {
            warn!("retry: failed job has no stored upload");
            return false;
        };

        // The machine re-checks the gate; a racing terminal event between
        // the snapshot and here makes this a rejected no-op.
        match self.handle.apply(JobEvent::RetryRequested).await {
            Ok(Applied::Applied) => {}
            _ => return false,
        }

        self.channel.start(upload).await.is_ok()
    }

    /// Cancel the active job
    ///
    /// Requests server-side cancellation best-effort, stops the channel,
    /// and returns the tracker to idle. Cancellation is not a failure.
    pub async fn cancel(&self) -> bool {
        debug!("ProgressFacade::cancel: called");
        let Ok(snapshot) = self.handle.snapshot().await else {
            return false;
        };
        if !snapshot.is_active() {
            debug!(status = %snapshot.status, "cancel: no active job");
            return false;
        }

        match snapshot.job_id {
            Some(job_id) => self.channel.cancel(&job_id).await,
            // Not accepted yet; there is nothing server-side to cancel.
            None => self.channel.stop().await,
        }

        matches!(self.handle.apply(JobEvent::ResetRequested).await, Ok(_))
    }

    /// Clear all progress state back to idle; always succeeds, idempotent
    pub async fn reset(&self) -> bool {
        debug!("ProgressFacade::reset: called");
        self.channel.stop().await;
        self.handle.apply(JobEvent::ResetRequested).await.is_ok()
    }

    /// Compute the current presentation view
    pub async fn view(&self) -> ProgressView {
        match self.handle.snapshot().await {
            Ok(snapshot) => ProgressView::from_state(&snapshot, now_ms()),
            Err(e) => {
                warn!(error = %e, "view: state actor unreachable, rendering idle");
                ProgressView::from_state(&ProgressState::default(), now_ms())
            }
        }
    }

    /// Shut down the state actor (end of session)
    pub async fn shutdown(&self) {
        self.channel.stop().await;
        let _ = self.handle.shutdown().await;
    }
}
