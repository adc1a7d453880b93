//! Message traces and tool-chain accounting
//!
//! Every backend invocation returns the ordered list of entries it produced.
//! The runner never looks at what a tool does; it only compares the number
//! of call entries against the number of return entries.

use serde::{Deserialize, Serialize};

/// One entry of a message trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TraceEntry {
    /// Text addressed to the backend
    User {
        /// Message text
        content: String,
    },
    /// Text produced by the backend
    Assistant {
        /// Message text
        content: String,
    },
    /// Reasoning or "thinking" output
    Reasoning {
        /// Reasoning text
        content: String,
    },
    /// A tool invocation requested by the backend
    ToolCall {
        /// Call identifier, matched by the return
        id: String,
        /// Tool name
        name: String,
        /// JSON-encoded arguments
        arguments: String,
    },
    /// The result handed back for a tool call
    ToolReturn {
        /// Identifier of the call being answered
        call_id: String,
        /// Tool output
        content: String,
    },
}

impl TraceEntry {
    /// Shorthand for a user entry
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Shorthand for an assistant entry
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    /// Shorthand for a reasoning entry
    pub fn reasoning(content: impl Into<String>) -> Self {
        Self::Reasoning {
            content: content.into(),
        }
    }

    /// Shorthand for a tool call entry
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Shorthand for a tool return entry
    pub fn tool_return(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolReturn {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    /// Whether this entry starts a new conversational turn
    #[must_use]
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// Whether this is reasoning output
    #[must_use]
    pub fn is_reasoning(&self) -> bool {
        matches!(self, Self::Reasoning { .. })
    }
}

/// Call/return counts derived from a trace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolInvocationRecord {
    /// Number of tool call entries
    pub calls: usize,
    /// Number of tool return entries
    pub returns: usize,
}

impl ToolInvocationRecord {
    /// A chain is complete when every call has been answered
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.calls <= self.returns
    }

    /// Calls still waiting for a return
    #[must_use]
    pub fn unanswered(&self) -> usize {
        self.calls.saturating_sub(self.returns)
    }
}

/// Ordered entries produced by one backend invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTrace {
    entries: Vec<TraceEntry>,
}

impl MessageTrace {
    /// Empty trace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries
    #[must_use]
    pub fn from_entries(entries: Vec<TraceEntry>) -> Self {
        Self { entries }
    }

    /// Append an entry
    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// Entries in order
    #[must_use]
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Take the entries
    #[must_use]
    pub fn into_entries(self) -> Vec<TraceEntry> {
        self.entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the trace is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count tool calls and returns
    #[must_use]
    pub fn tool_counts(&self) -> ToolInvocationRecord {
        self.entries
            .iter()
            .fold(ToolInvocationRecord::default(), |mut record, entry| {
                match entry {
                    TraceEntry::ToolCall { .. } => record.calls += 1,
                    TraceEntry::ToolReturn { .. } => record.returns += 1,
                    _ => {}
                }
                record
            })
    }

    /// Shorthand for `tool_counts().is_complete()`
    #[must_use]
    pub fn is_chain_complete(&self) -> bool {
        self.tool_counts().is_complete()
    }
}

impl From<Vec<TraceEntry>> for MessageTrace {
    fn from(entries: Vec<TraceEntry>) -> Self {
        Self::from_entries(entries)
    }
}

impl Extend<TraceEntry> for MessageTrace {
    fn extend<T: IntoIterator<Item = TraceEntry>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

impl IntoIterator for MessageTrace {
    type Item = TraceEntry;
    type IntoIter = std::vec::IntoIter<TraceEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
