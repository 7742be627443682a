//! Error types for the honeycomb pipeline.

use thiserror::Error;

/// Errors that can occur while building or shipping a cache.
///
/// Each variant maps to one recovery policy: configuration and job-state
/// problems abort the run before any tile work happens, render failures are
/// queued and retried by the orchestrator, transient upload failures are
/// retried with backoff inside the uploader, and everything else is logged
/// and counted without stopping the pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Missing or invalid configuration (env var, unknown basemap, bad levels).
    #[error("configuration error: {0}")]
    Config(String),

    /// Resumable-job bookkeeping problem (resume with no job, duplicate start).
    #[error("job state error: {0}")]
    JobState(String),

    /// The tile-building tool rejected a phase. Carries the tool's messages.
    #[error("render error: {}", .0.join("; "))]
    Render(Vec<String>),

    /// Transient network or server failure (timeouts, resets, 5xx, 429).
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent object-store failure (4xx, checksum mismatch after retries).
    #[error("upload error: {0}")]
    Upload(String),

    /// A notification could not be delivered.
    #[error("notification error: {0}")]
    Notification(String),

    /// Local filesystem failure.
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// HTTP failure outside the object store (cache-bust hook, journal).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Internal error (bugs, unexpected states, collaborator process failures).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new job-state error.
    pub fn job_state(msg: impl Into<String>) -> Self {
        Self::JobState(msg.into())
    }

    /// Create a new render error from the tool's messages.
    pub fn render(messages: Vec<String>) -> Self {
        Self::Render(messages)
    }

    /// Create a new transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a new permanent upload error.
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    /// Create a new notification error.
    pub fn notification(msg: impl Into<String>) -> Self {
        Self::Notification(msg.into())
    }

    /// Create a new filesystem error.
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem(msg.into())
    }

    /// Create a new HTTP error.
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether another attempt could plausibly succeed. Only transient
    /// network and server failures qualify; render errors have their own
    /// retry pass in the orchestrator, and the rest are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Filesystem(err.to_string())
    }
}

impl From<walkdir::Error> for PipelineError {
    fn from(err: walkdir::Error) -> Self {
        PipelineError::Filesystem(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            PipelineError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                PipelineError::Transient(err.to_string())
            } else {
                PipelineError::Upload(err.to_string())
            }
        } else {
            PipelineError::Transient(err.to_string())
        }
    }
}
