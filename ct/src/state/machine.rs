//! ProgressState transition machine
//!
//! The single source of truth for "the current job". All mutation goes
//! through [`ProgressState::apply`]; there is no other write path. The
//! machine is deliberately forgiving about events arriving in the wrong
//! state: network reordering can deliver a stale update after cancellation,
//! so out-of-state events are dropped and logged, never treated as fatal.
//!
//! States: `idle -> queued -> running -> {completed | failed}`, with
//! `retry` re-entering `queued` from `failed` and `reset` forcing `idle`
//! from anywhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{CitationInfo, JobStatus, RateLimitInfo, StepUpdate, UploadRequest};
use crate::progress::{ProcessingStep, apply_step_update};

/// Fallback failure message when the server reports none
const DEFAULT_FAILURE_MESSAGE: &str = "job failed";

/// Events that drive the progress state machine
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A new job was admitted (requires `Idle`)
    JobStarted {
        /// Input descriptor, retained for retry
        upload: UploadRequest,
    },
    /// The server accepted the job and assigned an id (requires `Queued`)
    JobAccepted {
        /// Server-assigned job id
        job_id: String,
    },
    /// Incremental progress report (requires `Queued` or `Running`)
    ServerUpdate {
        /// Monotonic per-job sequence number, when the transport provides one
        seq: Option<u64>,
        /// Step currently in progress
        current_step: Option<String>,
        /// Step entries in this update
        steps: Vec<StepUpdate>,
        /// Citation counts, when present
        citations: Option<CitationInfo>,
        /// Rate limit state, when present
        rate_limit: Option<RateLimitInfo>,
    },
    /// The job finished successfully (requires `Queued` or `Running`)
    JobCompleted {
        /// Monotonic per-job sequence number
        seq: Option<u64>,
        /// Opaque result payload
        result: Option<Value>,
    },
    /// The job failed (requires `Queued` or `Running`)
    JobFailed {
        /// Monotonic per-job sequence number
        seq: Option<u64>,
        /// Human-readable failure message
        message: String,
        /// Whether replaying the same input is worth offering
        retryable: bool,
    },
    /// Replay the stored upload (requires `Failed` with `can_retry`)
    RetryRequested,
    /// Force `Idle` and clear everything (always legal)
    ResetRequested,
}

impl JobEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job_started",
            Self::JobAccepted { .. } => "job_accepted",
            Self::ServerUpdate { .. } => "server_update",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::RetryRequested => "retry_requested",
            Self::ResetRequested => "reset_requested",
        }
    }
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Event mutated the state
    Applied,
    /// Sequence number was not greater than the last applied one
    DroppedStale,
    /// Event is not legal in the current status (late/reordered delivery)
    DroppedOutOfState,
    /// Caller asked for something the state forbids (e.g. retry without
    /// a retryable failure); surfaced to the user, state unchanged
    Rejected,
}

impl Applied {
    /// Whether the event changed the state
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// The one mutable progress record for the current job
///
/// Exactly one instance exists per tracker; observers read cloned
/// snapshots, never the live record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    /// Lifecycle status
    pub status: JobStatus,
    /// Input descriptor of the tracked job, kept for retry
    pub upload: Option<UploadRequest>,
    /// Server-assigned job id, once known
    pub job_id: Option<String>,
    /// Name of the step in progress; empty when not running
    pub current_step: String,
    /// Ordered step list in server discovery order
    pub steps: Vec<ProcessingStep>,
    /// Citation counts, once reported
    pub citations: Option<CitationInfo>,
    /// Rate limit snapshot, once reported
    pub rate_limit: Option<RateLimitInfo>,
    /// Failure message; present iff `status == Failed`
    pub error: Option<String>,
    /// Whether retry is offered; true only on a retryable failure
    pub can_retry: bool,
    /// When the job entered `Queued` (epoch ms)
    pub started_at_epoch_ms: Option<u64>,
    /// Opaque result payload; present iff `status == Completed`
    pub result: Option<Value>,
    /// Highest sequence number applied so far
    pub last_seq: u64,
}

impl ProgressState {
    /// Whether a job is currently in flight
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Whether results are available
    pub fn has_results(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// Apply one event, returning what happened to it
    ///
    /// `now_epoch_ms` is passed in so the transition function stays pure
    /// and clock-free for tests.
    pub fn apply(&mut self, event: JobEvent, now_epoch_ms: u64) -> Applied {
        debug!(event = event.name(), status = %self.status, "ProgressState::apply: called");
        match event {
            JobEvent::JobStarted { upload } => self.on_started(upload, now_epoch_ms),
            JobEvent::JobAccepted { job_id } => self.on_accepted(job_id),
            JobEvent::ServerUpdate {
                seq,
                current_step,
                steps,
                citations,
                rate_limit,
            } => self.on_update(seq, current_step, steps, citations, rate_limit),
            JobEvent::JobCompleted { seq, result } => self.on_completed(seq, result),
            JobEvent::JobFailed {
                seq,
                message,
                retryable,
            } => self.on_failed(seq, message, retryable),
            JobEvent::RetryRequested => self.on_retry(now_epoch_ms),
            JobEvent::ResetRequested => self.on_reset(),
        }
    }

    fn on_started(&mut self, upload: UploadRequest, now_epoch_ms: u64) -> Applied {
        if self.status != JobStatus::Idle {
            warn!(status = %self.status, "on_started: job already tracked, start rejected");
            return Applied::Rejected;
        }
        *self = Self {
            status: JobStatus::Queued,
            upload: Some(upload),
            started_at_epoch_ms: Some(now_epoch_ms),
            ..Self::default()
        };
        Applied::Applied
    }

    fn on_accepted(&mut self, job_id: String) -> Applied {
        if self.status != JobStatus::Queued || self.job_id.is_some() {
            debug!(status = %self.status, %job_id, "on_accepted: dropped out of state");
            return Applied::DroppedOutOfState;
        }
        debug!(%job_id, "on_accepted: server assigned job id");
        self.job_id = Some(job_id);
        Applied::Applied
    }

    fn on_update(
        &mut self,
        seq: Option<u64>,
        current_step: Option<String>,
        steps: Vec<StepUpdate>,
        citations: Option<CitationInfo>,
        rate_limit: Option<RateLimitInfo>,
    ) -> Applied {
        if !self.status.is_active() {
            debug!(status = %self.status, "on_update: dropped out of state");
            return Applied::DroppedOutOfState;
        }
        if !self.advance_seq(seq) {
            return Applied::DroppedStale;
        }

        // First update moves the job out of the queue.
        if self.status == JobStatus::Queued {
            debug!("on_update: first update, transitioning to running");
            self.status = JobStatus::Running;
        }

        for update in &steps {
            apply_step_update(&mut self.steps, update);
        }
        if let Some(step) = current_step {
            self.current_step = step;
        }
        // Partial updates: omission means "unchanged", not "clear".
        if let Some(info) = citations {
            self.citations = Some(info.normalized());
        }
        if let Some(info) = rate_limit {
            self.rate_limit = Some(info);
        }
        Applied::Applied
    }

    fn on_completed(&mut self, seq: Option<u64>, result: Option<Value>) -> Applied {
        if !self.status.is_active() {
            debug!(status = %self.status, "on_completed: dropped out of state");
            return Applied::DroppedOutOfState;
        }
        if !self.advance_seq(seq) {
            return Applied::DroppedStale;
        }
        self.status = JobStatus::Completed;
        self.current_step.clear();
        self.result = result;
        for step in &mut self.steps {
            step.completed = true;
        }
        Applied::Applied
    }

    fn on_failed(&mut self, seq: Option<u64>, message: String, retryable: bool) -> Applied {
        if !self.status.is_active() {
            debug!(status = %self.status, "on_failed: dropped out of state");
            return Applied::DroppedOutOfState;
        }
        if !self.advance_seq(seq) {
            return Applied::DroppedStale;
        }
        self.status = JobStatus::Failed;
        self.current_step.clear();
        self.error = Some(if message.trim().is_empty() {
            DEFAULT_FAILURE_MESSAGE.to_string()
        } else {
            message
        });
        self.can_retry = retryable;
        Applied::Applied
    }

    fn on_retry(&mut self, now_epoch_ms: u64) -> Applied {
        if self.status != JobStatus::Failed || !self.can_retry {
            warn!(status = %self.status, can_retry = self.can_retry, "on_retry: rejected");
            return Applied::Rejected;
        }
        let Some(upload) = self.upload.take() else {
            warn!("on_retry: no stored upload to replay");
            return Applied::Rejected;
        };
        // Same shape as a fresh start, replaying the stored input.
        *self = Self {
            status: JobStatus::Queued,
            upload: Some(upload),
            started_at_epoch_ms: Some(now_epoch_ms),
            ..Self::default()
        };
        Applied::Applied
    }

    fn on_reset(&mut self) -> Applied {
        debug!(status = %self.status, "on_reset: clearing state");
        *self = Self::default();
        Applied::Applied
    }

    /// Sequence guard: an event tagged with a sequence number must be
    /// strictly newer than the last applied one. Untagged events pass.
    fn advance_seq(&mut self, seq: Option<u64>) -> bool {
        let Some(seq) = seq else {
            return true;
        };
        if seq <= self.last_seq {
            debug!(seq, last_seq = self.last_seq, "advance_seq: stale event dropped");
            return false;
        }
        self.last_seq = seq;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UploadType;
    use proptest::prelude::*;

    fn now() -> u64 {
        crate::domain::now_ms()
    }

    fn started() -> ProgressState {
        let mut state = ProgressState::default();
        let applied = state.apply(
            JobEvent::JobStarted {
                upload: UploadRequest::new(UploadType::Text, "some citations"),
            },
            1_000,
        );
        assert_eq!(applied, Applied::Applied);
        state
    }

    fn update(seq: Option<u64>, steps: Vec<StepUpdate>) -> JobEvent {
        JobEvent::ServerUpdate {
            seq,
            current_step: None,
            steps,
            citations: None,
            rate_limit: None,
        }
    }

    fn step(name: &str, completed: bool) -> StepUpdate {
        StepUpdate {
            step: name.to_string(),
            completed,
            estimated_seconds: None,
            actual_seconds: None,
        }
    }

    #[test]
    fn test_start_requires_idle() {
        let mut state = started();
        let applied = state.apply(
            JobEvent::JobStarted {
                upload: UploadRequest::new(UploadType::Url, "https://example.com"),
            },
            now(),
        );
        assert_eq!(applied, Applied::Rejected);
        // Original descriptor untouched.
        assert_eq!(state.upload.as_ref().unwrap().upload_type, UploadType::Text);
    }

    #[test]
    fn test_first_update_moves_to_running() {
        let mut state = started();
        assert_eq!(state.status, JobStatus::Queued);
        state.apply(update(Some(1), vec![step("extract", false)]), now());
        assert_eq!(state.status, JobStatus::Running);
    }

    #[test]
    fn test_accepted_records_id_once() {
        let mut state = started();
        assert_eq!(
            state.apply(
                JobEvent::JobAccepted {
                    job_id: "job-1".to_string()
                },
                now()
            ),
            Applied::Applied
        );
        assert_eq!(
            state.apply(
                JobEvent::JobAccepted {
                    job_id: "job-2".to_string()
                },
                now()
            ),
            Applied::DroppedOutOfState
        );
        assert_eq!(state.job_id.as_deref(), Some("job-1"));
    }

    #[test]
    fn test_out_of_order_sequence_dropped() {
        let mut state = started();
        state.apply(update(Some(1), vec![step("extract", false)]), now());
        state.apply(update(Some(3), vec![step("extract", true)]), now());
        // Sequence 2 arrives late and must not be applied.
        let applied = state.apply(update(Some(2), vec![step("extract", false)]), now());
        assert_eq!(applied, Applied::DroppedStale);
        assert!(state.steps[0].completed);
        assert_eq!(state.last_seq, 3);
    }

    #[test]
    fn test_terminal_state_freezes_updates() {
        let mut state = started();
        state.apply(update(Some(1), vec![step("extract", false)]), now());
        state.apply(JobEvent::JobCompleted { seq: Some(2), result: None }, now());
        assert_eq!(state.status, JobStatus::Completed);

        let before = state.clone();
        let applied = state.apply(update(Some(3), vec![step("verify", false)]), now());
        assert_eq!(applied, Applied::DroppedOutOfState);
        assert_eq!(state.steps, before.steps);
        assert_eq!(state.status, before.status);
    }

    #[test]
    fn test_completed_marks_all_steps_done() {
        let mut state = started();
        state.apply(
            update(Some(1), vec![step("extract", true), step("verify", false)]),
            now(),
        );
        state.apply(JobEvent::JobCompleted { seq: Some(2), result: None }, now());
        assert!(state.steps.iter().all(|s| s.completed));
        assert!(state.current_step.is_empty());
        assert!(state.has_results());
    }

    #[test]
    fn test_failure_sets_error_and_retry_gate() {
        let mut state = started();
        state.apply(
            JobEvent::JobFailed {
                seq: None,
                message: "rate limited".to_string(),
                retryable: true,
            },
            now(),
        );
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("rate limited"));
        assert!(state.can_retry);
    }

    #[test]
    fn test_retry_replays_stored_upload() {
        let mut state = started();
        state.apply(
            JobEvent::JobFailed {
                seq: None,
                message: "rate limited".to_string(),
                retryable: true,
            },
            now(),
        );

        let applied = state.apply(JobEvent::RetryRequested, 9_000);
        assert_eq!(applied, Applied::Applied);
        assert_eq!(state.status, JobStatus::Queued);
        assert!(state.error.is_none());
        assert_eq!(state.started_at_epoch_ms, Some(9_000));
        assert_eq!(state.last_seq, 0);
        let upload = state.upload.as_ref().unwrap();
        assert_eq!(upload.upload_type, UploadType::Text);
        assert_eq!(upload.data, "some citations");
    }

    #[test]
    fn test_retry_rejected_when_not_retryable() {
        let mut state = started();
        state.apply(
            JobEvent::JobFailed {
                seq: None,
                message: "malformed document".to_string(),
                retryable: false,
            },
            now(),
        );
        let before = state.clone();
        assert_eq!(state.apply(JobEvent::RetryRequested, now()), Applied::Rejected);
        assert_eq!(state.status, before.status);
        assert_eq!(state.error, before.error);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut state = started();
        state.apply(update(Some(1), vec![step("extract", true)]), now());
        state.apply(JobEvent::ResetRequested, now());
        let after_first = state.clone();
        state.apply(JobEvent::ResetRequested, now());

        assert_eq!(state.status, JobStatus::Idle);
        assert_eq!(state.status, after_first.status);
        assert!(state.steps.is_empty());
        assert!(state.upload.is_none());
        assert!(state.started_at_epoch_ms.is_none());
    }

    #[test]
    fn test_update_merges_partial_fields() {
        let mut state = started();
        state.apply(
            JobEvent::ServerUpdate {
                seq: Some(1),
                current_step: Some("extract".to_string()),
                steps: vec![step("extract", false)],
                citations: Some(CitationInfo {
                    total: 10,
                    unique: 8,
                    processed: 2,
                }),
                rate_limit: None,
            },
            now(),
        );
        // Second update omits citations; prior value must survive.
        state.apply(
            JobEvent::ServerUpdate {
                seq: Some(2),
                current_step: Some("verify".to_string()),
                steps: vec![step("extract", true), step("verify", false)],
                citations: None,
                rate_limit: Some(RateLimitInfo {
                    remaining: 5,
                    limit: 60,
                    reset_epoch_seconds: 0,
                }),
            },
            now(),
        );

        assert_eq!(state.current_step, "verify");
        assert_eq!(state.citations.unwrap().processed, 2);
        assert_eq!(state.rate_limit.unwrap().remaining, 5);
    }

    // Random event sequences: the machine must keep its invariants no
    // matter what the transport throws at it.

    fn arb_event() -> impl Strategy<Value = JobEvent> {
        prop_oneof![
            Just(JobEvent::JobStarted {
                upload: UploadRequest::new(UploadType::Text, "payload"),
            }),
            "[a-z]{1,8}".prop_map(|id| JobEvent::JobAccepted { job_id: id }),
            (
                proptest::option::of(0u64..10),
                proptest::collection::vec(("[a-z]{1,6}", any::<bool>()), 0..3)
            )
                .prop_map(|(seq, steps)| JobEvent::ServerUpdate {
                    seq,
                    current_step: None,
                    steps: steps
                        .into_iter()
                        .map(|(name, completed)| StepUpdate {
                            step: name,
                            completed,
                            estimated_seconds: None,
                            actual_seconds: None,
                        })
                        .collect(),
                    citations: None,
                    rate_limit: None,
                }),
            proptest::option::of(0u64..10)
                .prop_map(|seq| JobEvent::JobCompleted { seq, result: None }),
            (proptest::option::of(0u64..10), ".{0,12}", any::<bool>()).prop_map(
                |(seq, message, retryable)| JobEvent::JobFailed {
                    seq,
                    message,
                    retryable,
                }
            ),
            Just(JobEvent::RetryRequested),
            Just(JobEvent::ResetRequested),
        ]
    }

    proptest! {
        #[test]
        fn prop_error_present_iff_failed(events in proptest::collection::vec(arb_event(), 0..40)) {
            let mut state = ProgressState::default();
            for event in events {
                state.apply(event, now());
                match state.status {
                    JobStatus::Failed => {
                        prop_assert!(state.error.as_ref().is_some_and(|e| !e.is_empty()));
                    }
                    _ => prop_assert!(state.error.is_none()),
                }
                if state.status == JobStatus::Idle {
                    prop_assert!(state.current_step.is_empty());
                    prop_assert!(state.steps.is_empty());
                }
                prop_assert_eq!(state.is_active(), state.status.is_active());
            }
        }
    }
}
