//! Error Types
//!
//! Errors surfaced by the broker, the backends and the worker pool.
//! Sessions and configuration keep their own error types next to the code
//! that produces them (`SinkError`, `ConfigError`).

use std::time::Duration;

use thiserror::Error;

use crate::job::ConnectionId;

/// Synchronous submission failures returned by [`crate::RequestBroker::submit`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The ingress queue is at capacity; the caller should retry later
    #[error("ingress queue is full (capacity {capacity})")]
    Backpressure {
        /// Configured queue capacity
        capacity: usize,
    },

    /// The broker no longer accepts work
    #[error("broker is shutting down")]
    ShuttingDown,
}

impl BrokerError {
    /// Whether this is a backpressure rejection
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }
}

/// Failures from a backend executor. Always terminal for the job.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport failure talking to the backend
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// The backend's payload could not be understood
    #[error("failed to decode backend response: {0}")]
    Decode(String),

    /// A streaming run closed without a completion marker
    #[error("backend stream ended without a completion marker")]
    StreamEnded,

    /// The backend reported an error mid-stream
    #[error("backend stream error: {0}")]
    Stream(String),

    /// No executor is registered under the requested name
    #[error("no backend registered under '{0}'")]
    NotConfigured(String),
}

/// The targeted session is no longer registered with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session {0} is closed")]
pub struct SessionClosedError(pub ConnectionId);

/// Why a job ended in the `Failed` state
#[derive(Debug, Error)]
pub enum JobFailure {
    /// Unrecoverable backend error
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The per-job hard timeout elapsed
    #[error("job exceeded its {0:?} time limit")]
    Timeout(Duration),

    /// The job task panicked
    #[error("job task panicked")]
    Panicked,

    /// The job task was cancelled before it finished
    #[error("job task was cancelled")]
    Cancelled,
}

impl JobFailure {
    /// Short machine-readable cause, carried in the error event metadata
    #[must_use]
    pub fn cause(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::Timeout(_) => "timeout",
            Self::Panicked => "panic",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::Backpressure { capacity: 100 };
        assert_eq!(err.to_string(), "ingress queue is full (capacity 100)");
        assert!(err.is_backpressure());
        assert!(!BrokerError::ShuttingDown.is_backpressure());
    }

    #[test]
    fn test_job_failure_cause() {
        assert_eq!(JobFailure::Timeout(Duration::from_secs(1)).cause(), "timeout");
        assert_eq!(JobFailure::Panicked.cause(), "panic");
        let backend = JobFailure::from(BackendError::StreamEnded);
        assert_eq!(backend.cause(), "backend");
        assert_eq!(
            backend.to_string(),
            "backend stream ended without a completion marker"
        );
    }
}
