//! Error types for the core. The backend taxonomy is deliberately flat:
//! timeout, connection failure, and non-2xx status are all "backend
//! unavailable" to the request path.

use std::time::Duration;
use thiserror::Error;

/// Failure talking to the LLM backend. All variants are treated uniformly
/// as "backend unavailable" by callers; the split exists for logging and
/// for the error-signature frequency tables.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend connection failed: {0}")]
    Connection(String),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("backend response could not be decoded: {0}")]
    Decode(String),
}

impl BackendError {
    /// Collapse a reqwest error into the taxonomy. The configured timeout is
    /// passed in so the timeout variant reports the bound that was exceeded.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(timeout)
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Connection(err.to_string())
        }
    }
}

/// Persistence failure. Callers on the request path treat this as
/// degrade-to-in-memory, never as a request failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sled::Error),
    #[error("record encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Request-path failure surfaced to the HTTP layer.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),
    #[error("internal failure: {0}")]
    Internal(String),
}
