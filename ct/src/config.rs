//! Citetrack configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main citetrack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task channel configuration
    pub channel: ChannelConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early so a bad config fails fast with a clear message
    /// instead of surfacing as a transport error mid-job.
    pub fn validate(&self) -> Result<()> {
        if self.channel.base_url.trim().is_empty() {
            return Err(eyre::eyre!("channel.base_url must not be empty"));
        }
        if self.channel.poll_interval_ms == 0 {
            return Err(eyre::eyre!("channel.poll_interval_ms must be greater than 0"));
        }
        if self.channel.max_job_duration_ms < self.channel.poll_interval_ms {
            return Err(eyre::eyre!(
                "channel.max_job_duration_ms must be at least one poll interval"
            ));
        }
        Ok(())
    }

    /// Load configuration, falling back through the search path
    ///
    /// An explicit path must load or the call errors; the implicit
    /// candidates (project-local `.citetrack.yml`, then the user config
    /// directory) are skipped with a warning when unreadable, and the
    /// defaults apply when nothing matches.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Unable to load config {}", path.display()));
        }

        let mut candidates = vec![PathBuf::from(".citetrack.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("citetrack").join("citetrack.yml"));
        }

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => {
                    tracing::debug!(path = %candidate.display(), "Config::load: loaded");
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "Config::load: unreadable config skipped");
                }
            }
        }

        tracing::info!("Config::load: no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context(format!("Unable to read {}", path.as_ref().display()))?;
        serde_yaml::from_str(&content).context("Invalid YAML in config file")
    }
}

/// Task channel behavior: endpoints, polling cadence, and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base URL of the verification server API
    pub base_url: String,

    /// Fixed interval between successful polls, in milliseconds
    pub poll_interval_ms: u64,

    /// Cap for the exponential backoff applied on transport errors
    pub max_backoff_ms: u64,

    /// Wall-clock budget for one job; exceeding it forces a retryable
    /// timeout failure
    pub max_job_duration_ms: u64,

    /// Per-request timeout for the HTTP transport
    pub request_timeout_ms: u64,

    /// Prefer the push stream over polling when the server offers one
    pub prefer_stream: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8420/api".to_string(),
            poll_interval_ms: 2_000,
            max_backoff_ms: 30_000,
            max_job_duration_ms: 600_000,
            request_timeout_ms: 30_000,
            prefer_stream: true,
        }
    }
}

impl ChannelConfig {
    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff cap as a `Duration`
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Job wall-clock budget as a `Duration`
    pub fn max_job_duration(&self) -> Duration {
        Duration::from_millis(self.max_job_duration_ms)
    }

    /// Per-request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff delay for the given consecutive-error count, capped
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(16));
        let ms = self.poll_interval_ms.saturating_mul(exp).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
