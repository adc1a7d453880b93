//! Chat jobs and the identifiers that route them
//!
//! A [`ChatJob`] is created when a connection submits text, is immutable
//! afterwards, and is owned by the broker until a worker claims it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a client connection
///
/// Each connection is assigned a unique ID when it connects.
/// This ID is stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value (for testing or deserialization)
    #[cfg(test)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Unique identifier for a chat job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh job ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. Higher values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Background work
    pub const LOW: Self = Self(0);
    /// Regular chat traffic
    pub const NORMAL: Self = Self(5);
    /// Served ahead of everything else
    pub const HIGH: Self = Self(10);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Which conversation context a job runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "connection", rename_all = "snake_case")]
pub enum HistoryRef {
    /// No prior context
    Fresh,
    /// The per-connection history kept by the broker
    Conversation(ConnectionId),
}

/// A unit of work submitted by a connection
#[derive(Debug, Clone)]
pub struct ChatJob {
    /// Job identifier
    pub id: JobId,
    /// Connection that owns the job's output
    pub connection_id: ConnectionId,
    /// User text
    pub prompt: String,
    /// Scheduling priority
    pub priority: Priority,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// Context the backend sees
    pub history_ref: HistoryRef,
    /// Backend name chosen at submission (`None` = broker default)
    pub backend: Option<String>,
}

impl ChatJob {
    /// Create a job with normal priority and fresh context
    pub fn new(connection_id: ConnectionId, prompt: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            connection_id,
            prompt: prompt.into(),
            priority: Priority::default(),
            submitted_at: Utc::now(),
            history_ref: HistoryRef::Fresh,
            backend: None,
        }
    }

    /// Set the scheduling priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the history reference
    #[must_use]
    pub fn with_history(mut self, history_ref: HistoryRef) -> Self {
        self.history_ref = history_ref;
        self
    }

    /// Run against the owning connection's conversation history
    #[must_use]
    pub fn with_conversation(self) -> Self {
        let id = self.connection_id;
        self.with_history(HistoryRef::Conversation(id))
    }

    /// Pick a backend by name
    #[must_use]
    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = Some(name.into());
        self
    }
}

/// Lifecycle of a job, tracked in the broker's ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting for a worker
    Pending,
    /// Primary backend invocation running
    Executing,
    /// Primary finished with unreturned tool calls
    Incomplete,
    /// A fallback invocation is running
    FallbackExecuting,
    /// Terminal: final event emitted normally
    Completed,
    /// Terminal: unrecoverable backend error or timeout
    Failed,
}

impl JobState {
    /// Whether this is one of the two terminal states
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique_and_display() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(ConnectionId::from_raw(7).to_string(), "conn-7");
        assert_eq!(ConnectionId::from_raw(7).as_u64(), 7);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
        assert_eq!(Priority::from(5), Priority::NORMAL);
    }

    #[test]
    fn test_chat_job_builder() {
        let conn = ConnectionId::from_raw(3);
        let job = ChatJob::new(conn, "hello")
            .with_priority(Priority::HIGH)
            .with_conversation()
            .with_backend("echo");

        assert_eq!(job.prompt, "hello");
        assert_eq!(job.priority, Priority::HIGH);
        assert_eq!(job.history_ref, HistoryRef::Conversation(conn));
        assert_eq!(job.backend.as_deref(), Some("echo"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::FallbackExecuting.is_terminal());
        assert!(!JobState::Pending.is_terminal());
    }
}
