//! Domain types for citation-verification job tracking
//!
//! These types form the vocabulary shared by the state machine, the task
//! channel, and the presentation view: job descriptors, status enums, and
//! the wire-level snapshot the server reports.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Current time in epoch milliseconds
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// How the input for a verification job was supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadType {
    /// Uploaded document file
    File,
    /// Remote URL to fetch
    Url,
    /// Pasted text
    #[default]
    Text,
}

impl std::fmt::Display for UploadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Url => write!(f, "url"),
            Self::Text => write!(f, "text"),
        }
    }
}

/// The input descriptor for one verification job
///
/// The payload is opaque to the tracker; it is retained only so a failed
/// job can be replayed on retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// How the input was supplied
    pub upload_type: UploadType,
    /// Opaque payload (path, URL, or raw text)
    pub data: String,
}

impl UploadRequest {
    /// Create a new upload request
    pub fn new(upload_type: UploadType, data: impl Into<String>) -> Self {
        let data = data.into();
        debug!(%upload_type, data_len = data.len(), "UploadRequest::new: called");
        Self { upload_type, data }
    }

    /// Whether the request carries a usable payload
    ///
    /// Empty payloads are rejected before a job is started; they never
    /// enter the state machine.
    pub fn is_valid(&self) -> bool {
        !self.data.trim().is_empty()
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No job tracked
    #[default]
    Idle,
    /// Accepted, waiting for the server to begin
    Queued,
    /// Server is processing
    Running,
    /// Verification finished with results
    Completed,
    /// Unrecoverable server or transport failure
    Failed,
}

impl JobStatus {
    /// Whether a job is currently in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether the status is terminal (no further updates applied)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Citation counts reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CitationInfo {
    /// Citations found in the document
    pub total: u32,
    /// Distinct citations after deduplication
    pub unique: u32,
    /// Citations verified so far
    pub processed: u32,
}

impl CitationInfo {
    /// Normalize server-reported counts
    ///
    /// `processed` can never exceed `total`; a server that reports
    /// otherwise is clamped and logged rather than trusted.
    pub fn normalized(self) -> Self {
        if self.processed > self.total {
            debug!(
                processed = self.processed,
                total = self.total,
                "CitationInfo::normalized: clamping processed to total"
            );
            return Self {
                processed: self.total,
                ..self
            };
        }
        self
    }

    /// Fraction of citations processed, in 0.0..=1.0
    pub fn completion(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.processed) / f64::from(self.total)
    }
}

/// Server-side rate limit snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RateLimitInfo {
    /// Requests remaining in the current window
    pub remaining: u32,
    /// Window size
    pub limit: u32,
    /// When the window resets (epoch seconds)
    pub reset_epoch_seconds: u64,
}

impl RateLimitInfo {
    /// Whether the server is at or near its request budget
    pub fn is_throttled(&self) -> bool {
        self.remaining == 0 && self.limit > 0
    }

    /// Short human-readable summary for display
    pub fn summary(&self) -> String {
        format!("{}/{} requests remaining", self.remaining, self.limit)
    }
}

/// One step entry as reported on the wire
///
/// Partial by design: a snapshot may report only the fields that changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    /// Step name (unique within a job)
    pub step: String,
    /// Whether the step has finished
    #[serde(default)]
    pub completed: bool,
    /// Server's estimate for this step, in seconds
    #[serde(default)]
    pub estimated_seconds: Option<f64>,
    /// Measured duration once the step finished
    #[serde(default)]
    pub actual_seconds: Option<f64>,
}

/// Raw job status snapshot as delivered by the server
///
/// Snapshots are partial: omitted fields mean "unchanged", never "clear".
/// The channel normalizes each snapshot into exactly one `JobEvent`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStatusSnapshot {
    /// Monotonic per-job sequence number, when the transport provides one
    pub seq: Option<u64>,
    /// Server-side status string ("queued", "running", "completed", "failed")
    pub status: String,
    /// Name of the step currently in progress
    pub current_step: Option<String>,
    /// Step entries reported in this snapshot
    pub steps: Vec<StepUpdate>,
    /// Citation counts, when known
    pub citations: Option<CitationInfo>,
    /// Rate limit state, when known
    pub rate_limit: Option<RateLimitInfo>,
    /// Failure message (present on "failed")
    pub error: Option<String>,
    /// Whether a reported failure is worth retrying
    pub retryable: Option<bool>,
    /// Opaque result payload (present on "completed")
    pub result: Option<Value>,
}

/// Server acknowledgment of a started job
#[derive(Debug, Clone, Deserialize)]
pub struct StartedJob {
    /// Server-assigned job id, immutable once set
    pub job_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_request_validity() {
        assert!(UploadRequest::new(UploadType::Text, "some text").is_valid());
        assert!(!UploadRequest::new(UploadType::Text, "   ").is_valid());
        assert!(!UploadRequest::new(UploadType::Url, "").is_valid());
    }

    #[test]
    fn test_job_status_predicates() {
        assert!(JobStatus::Queued.is_active());
        assert!(JobStatus::Running.is_active());
        assert!(!JobStatus::Idle.is_active());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_citation_info_clamps_processed() {
        let info = CitationInfo {
            total: 5,
            unique: 5,
            processed: 9,
        }
        .normalized();
        assert_eq!(info.processed, 5);
    }

    #[test]
    fn test_citation_completion() {
        let info = CitationInfo {
            total: 10,
            unique: 8,
            processed: 4,
        };
        assert!((info.completion() - 0.4).abs() < f64::EPSILON);

        let empty = CitationInfo::default();
        assert_eq!(empty.completion(), 0.0);
    }

    #[test]
    fn test_snapshot_deserializes_partial_payload() {
        let json = r#"{"status": "running", "current_step": "verify"}"#;
        let snapshot: JobStatusSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.status, "running");
        assert_eq!(snapshot.current_step.as_deref(), Some("verify"));
        assert!(snapshot.steps.is_empty());
        assert!(snapshot.citations.is_none());
        assert!(snapshot.seq.is_none());
    }

    #[test]
    fn test_rate_limit_summary() {
        let rl = RateLimitInfo {
            remaining: 3,
            limit: 60,
            reset_epoch_seconds: 1_700_000_000,
        };
        assert_eq!(rl.summary(), "3/60 requests remaining");
        assert!(!rl.is_throttled());
        assert!(
            RateLimitInfo {
                remaining: 0,
                limit: 60,
                reset_epoch_seconds: 0
            }
            .is_throttled()
        );
    }
}
