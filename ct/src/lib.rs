//! Citetrack - progress tracking for server-side citation-verification jobs
//!
//! Citetrack presents a single, consistent progress view of a long-running
//! verification job a client cannot directly observe: elapsed/remaining
//! time, step completion, citation counts, and rate-limit state, resolving
//! to success, failure, or cancellation exactly once regardless of how many
//! overlapping observers are watching.
//!
//! # Core Concepts
//!
//! - **One writer**: every mutation goes through a single state actor;
//!   observers only ever see consistent snapshots
//! - **Events, not objects**: the channel normalizes raw server snapshots
//!   into typed events validated by the state machine
//! - **Stale updates die at the fence**: sequence numbers and worker
//!   generations keep late or reordered deliveries out of the state
//! - **Pure derivation**: percentages, time estimates, and step status are
//!   computed from snapshots on read, never stored
//!
//! # Modules
//!
//! - [`domain`] - job descriptors, status enums, wire snapshot types
//! - [`progress`] - pure step tracking and time estimation
//! - [`state`] - the progress state machine and its single-writer actor
//! - [`channel`] - transport trait, poll/stream workers, HTTP implementation
//! - [`view`] - derived presentation values and the facade actions
//! - [`config`] - configuration types and loading

pub mod channel;
pub mod config;
pub mod domain;
pub mod progress;
pub mod state;
pub mod view;

// Re-export commonly used types
pub use channel::{ChannelError, HttpTransport, JobTransport, SnapshotStream, TaskChannel, normalize};
pub use config::{ChannelConfig, Config};
pub use domain::{
    CitationInfo, JobStatus, JobStatusSnapshot, RateLimitInfo, StartedJob, StepUpdate, UploadRequest, UploadType,
    now_ms,
};
pub use progress::{
    ProcessingStep, StepPhase, apply_step_update, classify, elapsed_seconds, format_duration, overall_completion,
    processing_rate, remaining_seconds,
};
pub use state::{Applied, JobEvent, ProgressChanged, ProgressHandle, ProgressState, StateError, StateResponse};
pub use view::{BarClass, ProgressFacade, ProgressView, StepView};
