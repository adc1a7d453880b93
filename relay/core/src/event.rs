//! Response events and the egress messages that carry them
//!
//! Only the worker executing a job produces its events. Sequence numbers
//! start at 0 and increase by one per event, so a connection can detect
//! gaps and reassemble output per job.

use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::runner::RunMode;

/// What a response event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Visible response text
    ContentDelta,
    /// Reasoning text, shown only when enabled
    ReasoningDelta,
    /// Terminal failure
    Error,
    /// Terminal success
    Done,
}

/// Metadata attached to terminal events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Whether at least one fallback invocation ran
    pub tool_fallback_used: bool,
    /// Number of fallback invocations
    pub attempts: u32,
    /// Whether the final trace had every tool call answered
    pub chain_complete: bool,
    /// Tool calls in the last counted trace
    pub tool_calls: usize,
    /// Tool returns in the last counted trace
    pub tool_returns: usize,
    /// Execution mode of the primary invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    /// Failure cause for error events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// A unit of output for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEvent {
    /// Job this event belongs to
    pub job_id: JobId,
    /// Position in the job's event stream
    pub sequence: u64,
    /// Event kind
    pub kind: EventKind,
    /// Text payload, empty for `done`
    pub text: String,
    /// Whether this is the job's last event
    pub is_final: bool,
    /// Terminal metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl ResponseEvent {
    /// Whether the event is visible text
    #[must_use]
    pub fn is_content(&self) -> bool {
        self.kind == EventKind::ContentDelta
    }
}

/// Severity of a connection notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Informational
    Info,
    /// Something the user should know about, e.g. a rejected submission
    Warn,
    /// A failure outside any job
    Error,
}

/// Connection-level message not tied to a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Severity
    pub level: NoticeLevel,
    /// Human-readable text
    pub text: String,
}

/// Request for the connection to perform a command and acknowledge it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Key the acknowledgement must echo back
    pub correlation_id: String,
    /// Job that issued the request
    pub job_id: JobId,
    /// Command to run on the connection's side
    pub command: String,
}

/// Anything queued for delivery to a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EgressMessage {
    /// Job output
    Event(ResponseEvent),
    /// Action round-trip request
    Action(ActionRequest),
    /// Connection notice
    Notice(Notice),
}

impl EgressMessage {
    /// The response event, if this message carries one
    #[must_use]
    pub fn as_event(&self) -> Option<&ResponseEvent> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl From<ResponseEvent> for EgressMessage {
    fn from(event: ResponseEvent) -> Self {
        Self::Event(event)
    }
}
