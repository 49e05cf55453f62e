//! HTTP transport for the verification server
//!
//! Implements the JobTransport trait over the server's REST + SSE API:
//! jobs are submitted with a POST, polled with a GET, streamed from an
//! `/events` endpoint, and cancelled with a DELETE.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use reqwest_eventsource::{Event, EventSource};
use tracing::{debug, warn};

use super::{ChannelError, JobTransport, SnapshotStream};
use crate::config::ChannelConfig;
use crate::domain::{JobStatusSnapshot, StartedJob, UploadRequest};

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 529)
}

/// Map a non-success HTTP response to a channel error
fn classify_status(status: StatusCode, job_id: Option<&str>) -> ChannelError {
    match status.as_u16() {
        404 => ChannelError::NotFound(job_id.unwrap_or("unknown").to_string()),
        400 | 422 => ChannelError::Validation(format!("server rejected request: {status}")),
        code if is_retryable_status(code) => ChannelError::Transport(format!("server returned {status}")),
        _ => ChannelError::Transport(format!("unexpected status {status}")),
    }
}

/// HTTP + SSE implementation of the job transport
pub struct HttpTransport {
    base_url: String,
    http: Client,
}

impl HttpTransport {
    /// Create a transport from channel configuration
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ChannelError> {
        debug!(base_url = %config.base_url, "HttpTransport::from_config: called");
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/jobs/{}", self.base_url, job_id)
    }
}

#[async_trait]
impl JobTransport for HttpTransport {
    async fn start_job(&self, upload: &UploadRequest) -> Result<StartedJob, ChannelError> {
        debug!(upload_type = %upload.upload_type, "start_job: called");
        let url = format!("{}/jobs", self.base_url);
        let body = serde_json::json!({
            "upload_type": upload.upload_type,
            "data": upload.data,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "start_job: server rejected submission");
            return Err(classify_status(status, None));
        }

        response
            .json::<StartedJob>()
            .await
            .map_err(|e| ChannelError::Protocol(format!("malformed start response: {e}")))
    }

    async fn poll_job(&self, job_id: &str) -> Result<JobStatusSnapshot, ChannelError> {
        let response = self
            .http
            .get(self.job_url(job_id))
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, Some(job_id)));
        }

        response
            .json::<JobStatusSnapshot>()
            .await
            .map_err(|e| ChannelError::Protocol(format!("malformed snapshot: {e}")))
    }

    async fn open_stream(&self, job_id: &str) -> Result<SnapshotStream, ChannelError> {
        debug!(%job_id, "open_stream: called");
        let url = format!("{}/events", self.job_url(job_id));
        let request = self.http.get(&url);

        let source = EventSource::new(request)
            .map_err(|e| ChannelError::Transport(format!("failed to open event stream: {e}")))?;

        // Dropping the returned stream drops the EventSource, which closes
        // the connection and stops server-side push.
        let stream = source.filter_map(|event| async move {
            match event {
                Ok(Event::Open) => {
                    debug!("open_stream: connection established");
                    None
                }
                Ok(Event::Message(message)) => Some(
                    serde_json::from_str::<JobStatusSnapshot>(&message.data)
                        .map_err(|e| ChannelError::Protocol(format!("malformed event payload: {e}"))),
                ),
                Err(e) => Some(Err(ChannelError::Transport(e.to_string()))),
            }
        });

        Ok(stream.boxed())
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), ChannelError> {
        debug!(%job_id, "cancel_job: called");
        let response = self
            .http
            .delete(self.job_url(job_id))
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, Some(job_id)));
        }
        Ok(())
    }
}
