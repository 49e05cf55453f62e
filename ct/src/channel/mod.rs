//! Task channel - owns the live connection to the remote job
//!
//! Exactly one worker task serves the active job, whether it consumes a
//! push stream or a poll loop. Every worker is tagged with a generation
//! number; stopping the channel bumps the generation so a late response
//! from an old worker can never mutate state after a new job has started.

mod error;
mod http;
mod worker;

pub use error::ChannelError;
pub use http::HttpTransport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::domain::{JobStatusSnapshot, StartedJob, UploadRequest};
use crate::state::{JobEvent, ProgressHandle};

/// A cancellable, possibly-infinite sequence of job snapshots
///
/// Dropping the stream must stop server-side push.
pub type SnapshotStream = BoxStream<'static, Result<JobStatusSnapshot, ChannelError>>;

/// Transport contract to the verification server
///
/// Implementations own the wire details (HTTP, SSE, in-memory fakes);
/// the channel only sees typed results.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Submit a new job, returning the server-assigned id
    async fn start_job(&self, upload: &UploadRequest) -> Result<StartedJob, ChannelError>;

    /// Fetch the current status snapshot for a job
    async fn poll_job(&self, job_id: &str) -> Result<JobStatusSnapshot, ChannelError>;

    /// Open a push stream of status snapshots for a job
    async fn open_stream(&self, job_id: &str) -> Result<SnapshotStream, ChannelError>;

    /// Request server-side cancellation, best effort
    async fn cancel_job(&self, job_id: &str) -> Result<(), ChannelError>;
}

/// Normalize a wire snapshot into exactly one state machine event
///
/// Unknown status strings are a protocol error: the snapshot is dropped
/// and the job continues.
pub fn normalize(snapshot: JobStatusSnapshot) -> Result<JobEvent, ChannelError> {
    match snapshot.status.as_str() {
        "queued" | "running" | "processing" => Ok(JobEvent::ServerUpdate {
            seq: snapshot.seq,
            current_step: snapshot.current_step,
            steps: snapshot.steps,
            citations: snapshot.citations,
            rate_limit: snapshot.rate_limit,
        }),
        "completed" | "complete" => Ok(JobEvent::JobCompleted {
            seq: snapshot.seq,
            result: snapshot.result,
        }),
        "failed" | "error" => Ok(JobEvent::JobFailed {
            seq: snapshot.seq,
            message: snapshot.error.unwrap_or_default(),
            // Server-reported failures are retryable only when marked so.
            retryable: snapshot.retryable.unwrap_or(false),
        }),
        other => Err(ChannelError::Protocol(format!("unknown status {other:?}"))),
    }
}

/// One spawned worker serving a single job
struct WorkerSlot {
    job_id: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the single live connection to the remote job
pub struct TaskChannel {
    transport: Arc<dyn JobTransport>,
    handle: ProgressHandle,
    config: ChannelConfig,
    /// Generation of the currently active worker; bumped on every start
    /// and stop so stale workers can detect they were replaced
    generation: Arc<AtomicU64>,
    worker: Mutex<Option<WorkerSlot>>,
}

impl TaskChannel {
    /// Create a channel over the given transport
    pub fn new(transport: Arc<dyn JobTransport>, handle: ProgressHandle, config: ChannelConfig) -> Self {
        debug!(base_url = %config.base_url, prefer_stream = config.prefer_stream, "TaskChannel::new: called");
        Self {
            transport,
            handle,
            config,
            generation: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Submit the upload and spawn the worker for the new job
    ///
    /// Any previous worker is stopped first; there is at most one
    /// in-flight connection per channel. The caller must already have
    /// admitted the job into the state machine (`JobStarted`).
    pub async fn start(&self, upload: UploadRequest) -> Result<String, ChannelError> {
        debug!(upload_type = %upload.upload_type, "TaskChannel::start: called");
        self.stop().await;

        let started = match self.transport.start_job(&upload).await {
            Ok(started) => started,
            Err(e) => {
                warn!(error = %e, "TaskChannel::start: start_job failed");
                let _ = self
                    .handle
                    .apply(JobEvent::JobFailed {
                        seq: None,
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    })
                    .await;
                return Err(e);
            }
        };

        let job_id = started.job_id;
        let _ = self
            .handle
            .apply(JobEvent::JobAccepted {
                job_id: job_id.clone(),
            })
            .await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = worker::WorkerContext {
            transport: Arc::clone(&self.transport),
            handle: self.handle.clone(),
            config: self.config.clone(),
            job_id: job_id.clone(),
            generation,
            active_generation: Arc::clone(&self.generation),
            stop_rx,
        };
        let task = tokio::spawn(worker::run(ctx));

        let mut slot = self.worker.lock().await;
        *slot = Some(WorkerSlot {
            job_id: job_id.clone(),
            stop_tx,
            task,
        });

        Ok(job_id)
    }

    /// Stop the active worker, if any; idempotent
    ///
    /// Bumps the generation before signaling, so even a poll response
    /// already in flight is discarded instead of reaching the state actor.
    pub async fn stop(&self) {
        let mut slot = self.worker.lock().await;
        let Some(worker) = slot.take() else {
            debug!("TaskChannel::stop: no active worker");
            return;
        };
        debug!(job_id = %worker.job_id, "TaskChannel::stop: stopping worker");
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = worker.stop_tx.send(true);
        // The signal lets a parked worker exit cleanly; the abort makes
        // sure no further poll is issued once stop returns. Either way the
        // generation bump already fences any update still in flight.
        worker.task.abort();
    }

    /// Request server-side cancellation and stop the local worker
    ///
    /// The server call is fire-and-forget with best-effort acknowledgment;
    /// failures are logged, never surfaced.
    pub async fn cancel(&self, job_id: &str) {
        debug!(%job_id, "TaskChannel::cancel: called");
        self.stop().await;

        let transport = Arc::clone(&self.transport);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = transport.cancel_job(&job_id).await {
                debug!(error = %e, %job_id, "cancel_job: server-side cancellation not acknowledged");
            }
        });
    }

    /// Id of the job the active worker serves, if any
    pub async fn active_job(&self) -> Option<String> {
        self.worker.lock().await.as_ref().map(|w| w.job_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepUpdate;

    #[test]
    fn test_normalize_running_snapshot() {
        let snapshot = JobStatusSnapshot {
            seq: Some(4),
            status: "running".to_string(),
            current_step: Some("verify".to_string()),
            steps: vec![StepUpdate {
                step: "extract".to_string(),
                completed: true,
                estimated_seconds: None,
                actual_seconds: Some(8.0),
            }],
            ..Default::default()
        };
        match normalize(snapshot).unwrap() {
            JobEvent::ServerUpdate {
                seq, current_step, steps, ..
            } => {
                assert_eq!(seq, Some(4));
                assert_eq!(current_step.as_deref(), Some("verify"));
                assert_eq!(steps.len(), 1);
            }
            other => panic!("Expected ServerUpdate, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_terminal_snapshots() {
        let completed = JobStatusSnapshot {
            status: "completed".to_string(),
            ..Default::default()
        };
        assert!(matches!(normalize(completed).unwrap(), JobEvent::JobCompleted { .. }));

        let failed = JobStatusSnapshot {
            status: "failed".to_string(),
            error: Some("rate limited".to_string()),
            retryable: Some(true),
            ..Default::default()
        };
        match normalize(failed).unwrap() {
            JobEvent::JobFailed {
                message, retryable, ..
            } => {
                assert_eq!(message, "rate limited");
                assert!(retryable);
            }
            other => panic!("Expected JobFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_defaults_failure_to_not_retryable() {
        let failed = JobStatusSnapshot {
            status: "failed".to_string(),
            ..Default::default()
        };
        match normalize(failed).unwrap() {
            JobEvent::JobFailed { retryable, .. } => assert!(!retryable),
            other => panic!("Expected JobFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_rejects_unknown_status() {
        let snapshot = JobStatusSnapshot {
            status: "exploded".to_string(),
            ..Default::default()
        };
        assert!(matches!(normalize(snapshot), Err(ChannelError::Protocol(_))));
    }
}
