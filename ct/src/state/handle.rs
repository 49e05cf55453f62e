//! ProgressHandle - actor that owns the ProgressState
//!
//! Processes events via channels so every mutation is serialized through a
//! single writer. Observers read cloned snapshots and subscribe to a
//! broadcast channel for change notifications.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use super::machine::{Applied, JobEvent, ProgressState};
use crate::domain::{JobStatus, now_ms};

/// Command channel capacity; updates are small and applied quickly
const COMMAND_CAPACITY: usize = 256;

/// Broadcast capacity for change notifications
const CHANGE_CAPACITY: usize = 64;

/// Errors from the state actor
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State actor is gone")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the state actor
#[derive(Debug)]
enum StateCommand {
    Apply {
        event: JobEvent,
        reply: oneshot::Sender<Applied>,
    },
    Snapshot {
        reply: oneshot::Sender<ProgressState>,
    },
    Shutdown,
}

/// Change notification broadcast after every applied event
#[derive(Debug, Clone)]
pub enum ProgressChanged {
    /// The lifecycle status moved
    StatusChanged {
        /// Previous status
        from: JobStatus,
        /// New status
        to: JobStatus,
    },
    /// Progress fields changed without a status move
    ProgressUpdated,
}

/// Handle to send events to the progress state actor
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<StateCommand>,
    change_tx: broadcast::Sender<ProgressChanged>,
}

impl ProgressHandle {
    /// Spawn the actor owning a fresh `ProgressState`
    pub fn spawn() -> Self {
        debug!("ProgressHandle::spawn: called");
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (change_tx, _) = broadcast::channel(CHANGE_CAPACITY);

        tokio::spawn(actor_loop(ProgressState::default(), rx, change_tx.clone()));
        info!("Progress state actor spawned");

        Self { tx, change_tx }
    }

    /// Subscribe to change notifications (for reactive observers)
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ProgressChanged> {
        debug!("ProgressHandle::subscribe_changes: new subscriber");
        self.change_tx.subscribe()
    }

    /// Apply one event through the single writer
    pub async fn apply(&self, event: JobEvent) -> StateResponse<Applied> {
        debug!(event = event.name(), "ProgressHandle::apply: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::Apply {
                event,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)
    }

    /// Take an immutable snapshot of the current state
    ///
    /// The clone happens inside the actor, so the snapshot can never
    /// observe a partially applied event.
    pub async fn snapshot(&self) -> StateResponse<ProgressState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)
    }

    /// Shut the actor down
    pub async fn shutdown(&self) -> StateResponse<()> {
        debug!("ProgressHandle::shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

/// The actor loop that owns the ProgressState and processes commands
async fn actor_loop(
    mut state: ProgressState,
    mut rx: mpsc::Receiver<StateCommand>,
    change_tx: broadcast::Sender<ProgressChanged>,
) {
    debug!("actor_loop: progress state actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::Apply { event, reply } => {
                let before = state.status;
                let applied = state.apply(event, now_ms());
                if applied.is_applied() {
                    let notification = if state.status != before {
                        ProgressChanged::StatusChanged {
                            from: before,
                            to: state.status,
                        }
                    } else {
                        ProgressChanged::ProgressUpdated
                    };
                    // Fire-and-forget: no subscribers is fine.
                    let _ = change_tx.send(notification);
                }
                let _ = reply.send(applied);
            }

            StateCommand::Snapshot { reply } => {
                let _ = reply.send(state.clone());
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("Progress state actor shutting down");
                break;
            }
        }
    }

    debug!("actor_loop: progress state actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{UploadRequest, UploadType};

    fn start_event() -> JobEvent {
        JobEvent::JobStarted {
            upload: UploadRequest::new(UploadType::Text, "citations"),
        }
    }

    #[tokio::test]
    async fn test_apply_and_snapshot() {
        let handle = ProgressHandle::spawn();

        let applied = handle.apply(start_event()).await.unwrap();
        assert_eq!(applied, Applied::Applied);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert!(snapshot.started_at_epoch_ms.is_some());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let handle = ProgressHandle::spawn();
        handle.apply(start_event()).await.unwrap();

        let applied = handle.apply(start_event()).await.unwrap();
        assert_eq!(applied, Applied::Rejected);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_change_broadcast_on_status_move() {
        let handle = ProgressHandle::spawn();
        let mut changes = handle.subscribe_changes();

        handle.apply(start_event()).await.unwrap();

        let change = changes.recv().await.unwrap();
        match change {
            ProgressChanged::StatusChanged { from, to } => {
                assert_eq!(from, JobStatus::Idle);
                assert_eq!(to, JobStatus::Queued);
            }
            other => panic!("Expected StatusChanged, got {:?}", other),
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_events_do_not_broadcast() {
        let handle = ProgressHandle::spawn();
        let mut changes = handle.subscribe_changes();

        // Update in Idle is dropped; no notification should be sent.
        let applied = handle
            .apply(JobEvent::ServerUpdate {
                seq: Some(1),
                current_step: None,
                steps: vec![],
                citations: None,
                rate_limit: None,
            })
            .await
            .unwrap();
        assert_eq!(applied, Applied::DroppedOutOfState);
        assert!(changes.try_recv().is_err());

        handle.shutdown().await.unwrap();
    }
}
