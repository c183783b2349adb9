use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the pipeline core.
///
/// `Auth`, `Quota` and `Validation` are never retried; `RateLimited` and
/// `Server` are retried with backoff until the budget is spent, at which
/// point the last cause is wrapped in `ExhaustedRetries`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication rejected (HTTP 401): {0}")]
    Auth(String),

    #[error("insufficient credits (HTTP 402): {0}")]
    Quota(String),

    #[error("request rejected (HTTP 422): {0}")]
    Validation(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<f64> },

    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    #[error("gave up after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("task {task_id} did not finish within {waited_secs}s (last status: {last_status})")]
    Timeout {
        task_id: String,
        waited_secs: u64,
        last_status: String,
    },

    #[error("status file {path} exists but cannot be parsed: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not materialize {path}: {reason}")]
    Materialize { path: PathBuf, reason: String },

    #[error("unexpected response shape: {0}")]
    BadResponse(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the retry wrapper may try this request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::RateLimited { .. } | PipelineError::Server { .. } => true,
            PipelineError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(PipelineError::RateLimited { retry_after: None }.is_retryable());
        assert!(PipelineError::Server { status: 503 }.is_retryable());
        assert!(!PipelineError::Auth("bad key".into()).is_retryable());
        assert!(!PipelineError::Quota("no credits".into()).is_retryable());
        assert!(!PipelineError::Validation("empty prompt".into()).is_retryable());
        let exhausted = PipelineError::ExhaustedRetries {
            attempts: 5,
            source: Box::new(PipelineError::Server { status: 500 }),
        };
        assert!(!exhausted.is_retryable());
    }
}
