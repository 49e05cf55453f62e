//! Channel error taxonomy
//!
//! Transport-layer failures never escape to presentation code as raised
//! errors; the channel turns them into `JobFailed` events. The taxonomy
//! exists so that conversion can classify retryability correctly.

use thiserror::Error;

/// Errors from the task channel and its transports
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Bad input rejected before a job starts; never enters the state machine
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Network or server failure while a job is active; retryable by default
    #[error("Transport error: {0}")]
    Transport(String),

    /// The poll loop exceeded its wall-clock budget; retryable
    #[error("Job timed out")]
    Timeout,

    /// The server explicitly failed the job
    #[error("Server reported failure: {message}")]
    ServerReported {
        /// Server-provided failure message
        message: String,
        /// Retryable only if the server marks it so
        retryable: bool,
    },

    /// Malformed or unexpected update shape; the update is dropped and
    /// the job continues
    #[error("Malformed update: {0}")]
    Protocol(String),

    /// The server does not know the job id
    #[error("Job not found: {0}")]
    NotFound(String),
}

impl ChannelError {
    /// Whether replaying the same input is worth offering to the user
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::ServerReported { retryable, .. } => *retryable,
            Self::Validation(_) | Self::Protocol(_) | Self::NotFound(_) => false,
        }
    }
}
