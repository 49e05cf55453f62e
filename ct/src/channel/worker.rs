//! Channel workers - the poll loop and the stream loop
//!
//! One worker task serves one job. The stream loop is preferred when the
//! transport offers push; on a transport failure it falls back to polling,
//! while malformed payloads are dropped in place and the job continues.
//! Both loops respect the stop signal at every await point and the shared
//! generation counter fences any update from a replaced worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ChannelError, JobTransport, normalize};
use crate::config::ChannelConfig;
use crate::state::{JobEvent, ProgressHandle};

/// Message used when the wall-clock budget is exhausted
const TIMEOUT_MESSAGE: &str = "timeout";

/// Everything one worker needs to serve its job
pub(crate) struct WorkerContext {
    pub transport: Arc<dyn JobTransport>,
    pub handle: ProgressHandle,
    pub config: ChannelConfig,
    pub job_id: String,
    /// Generation this worker was spawned with
    pub generation: u64,
    /// Live generation of the owning channel; mismatch means this worker
    /// was replaced and must not touch state
    pub active_generation: Arc<AtomicU64>,
    pub stop_rx: watch::Receiver<bool>,
}

impl WorkerContext {
    fn is_stale(&self) -> bool {
        self.active_generation.load(Ordering::SeqCst) != self.generation
    }
}

/// What happened to an event handed to the state actor
enum ApplyOutcome {
    /// Keep receiving updates
    Continue,
    /// Job reached a terminal status; the worker is done
    Terminal,
    /// Worker was replaced or the actor is gone; exit without touching state
    Abort,
}

/// Why the stream loop returned
enum StreamOutcome {
    /// Job finished (or worker stopped); nothing left to do
    Done,
    /// Stream unusable; switch to polling
    Fallback,
}

/// Worker entry point
pub(crate) async fn run(ctx: WorkerContext) {
    debug!(job_id = %ctx.job_id, generation = ctx.generation, "worker::run: started");
    // The stop receiver lives outside the context so select! arms can
    // poll it while handlers still read the context.
    let mut stop_rx = ctx.stop_rx.clone();
    let deadline = Instant::now() + ctx.config.max_job_duration();

    if ctx.config.prefer_stream {
        match stream_loop(&ctx, &mut stop_rx, deadline).await {
            StreamOutcome::Done => {
                debug!(job_id = %ctx.job_id, "worker::run: finished via stream");
                return;
            }
            StreamOutcome::Fallback => {
                debug!(job_id = %ctx.job_id, "worker::run: falling back to polling");
            }
        }
    }

    poll_loop(&ctx, &mut stop_rx, deadline).await;
    debug!(job_id = %ctx.job_id, "worker::run: finished");
}

/// Consume the push stream until a terminal event, stop, or failure
async fn stream_loop(
    ctx: &WorkerContext,
    stop_rx: &mut watch::Receiver<bool>,
    deadline: Instant,
) -> StreamOutcome {
    let mut stream = match ctx.transport.open_stream(&ctx.job_id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, job_id = %ctx.job_id, "stream_loop: open_stream failed");
            return StreamOutcome::Fallback;
        }
    };
    debug!(job_id = %ctx.job_id, "stream_loop: stream open");

    loop {
        if *stop_rx.borrow() {
            return StreamOutcome::Done;
        }

        tokio::select! {
            _ = stop_rx.changed() => {
                debug!(job_id = %ctx.job_id, "stream_loop: stop signal");
                return StreamOutcome::Done;
            }
            _ = tokio::time::sleep_until(deadline) => {
                force_timeout(ctx).await;
                return StreamOutcome::Done;
            }
            item = stream.next() => match item {
                Some(Ok(snapshot)) => match normalize(snapshot) {
                    Ok(event) => match apply(ctx, event).await {
                        ApplyOutcome::Continue => {}
                        ApplyOutcome::Terminal | ApplyOutcome::Abort => return StreamOutcome::Done,
                    },
                    // A single malformed update must not abort a healthy job.
                    Err(e) => warn!(error = %e, "stream_loop: malformed snapshot dropped"),
                },
                Some(Err(ChannelError::Protocol(message))) => {
                    // The stream itself is healthy; only this item was bad.
                    warn!(%message, "stream_loop: malformed stream item dropped");
                }
                Some(Err(e)) => {
                    warn!(error = %e, job_id = %ctx.job_id, "stream_loop: stream error");
                    return StreamOutcome::Fallback;
                }
                None => {
                    warn!(job_id = %ctx.job_id, "stream_loop: stream ended without terminal status");
                    return StreamOutcome::Fallback;
                }
            }
        }
    }
}

/// Poll at a fixed interval with capped exponential backoff on errors
async fn poll_loop(ctx: &WorkerContext, stop_rx: &mut watch::Receiver<bool>, deadline: Instant) {
    let mut consecutive_errors: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            debug!(job_id = %ctx.job_id, "poll_loop: stop signal");
            return;
        }
        if Instant::now() >= deadline {
            force_timeout(ctx).await;
            return;
        }

        match ctx.transport.poll_job(&ctx.job_id).await {
            Ok(snapshot) => {
                consecutive_errors = 0;
                match normalize(snapshot) {
                    Ok(event) => match apply(ctx, event).await {
                        ApplyOutcome::Continue => {}
                        ApplyOutcome::Terminal | ApplyOutcome::Abort => return,
                    },
                    Err(e) => warn!(error = %e, "poll_loop: malformed snapshot dropped"),
                }
                if wait(stop_rx, ctx.config.poll_interval()).await {
                    debug!(job_id = %ctx.job_id, "poll_loop: stop signal during interval");
                    return;
                }
            }
            Err(ChannelError::Protocol(message)) => {
                // The server answered; only the body was unusable. Drop
                // the response and keep polling at the normal cadence.
                consecutive_errors = 0;
                warn!(%message, job_id = %ctx.job_id, "poll_loop: malformed response dropped");
                if wait(stop_rx, ctx.config.poll_interval()).await {
                    debug!(job_id = %ctx.job_id, "poll_loop: stop signal during interval");
                    return;
                }
            }
            Err(e) if e.is_retryable() => {
                consecutive_errors += 1;
                let backoff = ctx.config.backoff_for_attempt(consecutive_errors);
                warn!(
                    error = %e,
                    consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "poll_loop: transport error, backing off"
                );
                if wait(stop_rx, backoff).await {
                    debug!(job_id = %ctx.job_id, "poll_loop: stop signal during backoff");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, job_id = %ctx.job_id, "poll_loop: unrecoverable transport error");
                let _ = apply(
                    ctx,
                    JobEvent::JobFailed {
                        seq: None,
                        message: e.to_string(),
                        retryable: false,
                    },
                )
                .await;
                return;
            }
        }
    }
}

/// Hand one event to the state actor, fenced by the generation counter
async fn apply(ctx: &WorkerContext, event: JobEvent) -> ApplyOutcome {
    if ctx.is_stale() {
        debug!(job_id = %ctx.job_id, "apply: worker replaced, update discarded");
        return ApplyOutcome::Abort;
    }

    let terminal = matches!(event, JobEvent::JobCompleted { .. } | JobEvent::JobFailed { .. });
    match ctx.handle.apply(event).await {
        Ok(applied) if terminal && applied.is_applied() => ApplyOutcome::Terminal,
        Ok(crate::state::Applied::DroppedOutOfState) => {
            // The job already resolved (or was reset) elsewhere.
            debug!(job_id = %ctx.job_id, "apply: state no longer accepts updates for this job");
            ApplyOutcome::Abort
        }
        Ok(_) => ApplyOutcome::Continue,
        Err(e) => {
            warn!(error = %e, "apply: state actor unreachable");
            ApplyOutcome::Abort
        }
    }
}

/// Force a retryable timeout failure
async fn force_timeout(ctx: &WorkerContext) {
    warn!(job_id = %ctx.job_id, "force_timeout: job exceeded wall-clock budget");
    let _ = apply(
        ctx,
        JobEvent::JobFailed {
            seq: None,
            message: TIMEOUT_MESSAGE.to_string(),
            retryable: true,
        },
    )
    .await;
}

/// Cancellable wait; returns true when stop was requested
async fn wait(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.changed() => true,
    }
}
