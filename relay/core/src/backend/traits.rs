//! Backend Executor Traits
//!
//! A backend runs one prompt, either streaming or all at once, and reports
//! the message trace it produced. The trace is what the runner uses to tell
//! whether every tool call the backend issued was answered.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::tools::{NoTools, ToolSet};
use crate::trace::{MessageTrace, TraceEntry};

/// Items of a streaming run
#[derive(Clone, Debug)]
pub enum StreamingToken {
    /// Visible text delta
    Content(String),
    /// Reasoning delta
    Reasoning(String),
    /// Run finished. Every well-formed stream ends with this.
    Complete {
        /// Full response text
        text: String,
        /// Entries produced by this run, prompt excluded
        trace: MessageTrace,
    },
    /// Run failed mid-stream
    Error(String),
}

/// Result of a batch run
#[derive(Clone, Debug, Default)]
pub struct BatchOutput {
    /// Full response text
    pub text: String,
    /// Entries produced by this run, prompt excluded
    pub trace: MessageTrace,
}

impl BatchOutput {
    /// Build from text and trace
    pub fn new(text: impl Into<String>, trace: MessageTrace) -> Self {
        Self {
            text: text.into(),
            trace,
        }
    }
}

/// One backend invocation
#[derive(Clone)]
pub struct BackendRequest {
    /// Text for this invocation
    pub prompt: String,
    /// Earlier entries the backend should see, oldest first
    pub history: Vec<TraceEntry>,
    /// System prompt
    pub system: Option<String>,
    /// Model override; `None` uses the backend's configured model
    pub model: Option<String>,
    /// Tools the backend may call
    pub tools: Arc<dyn ToolSet>,
}

impl BackendRequest {
    /// Request with no history and no tools
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
            system: None,
            model: None,
            tools: Arc::new(NoTools),
        }
    }

    /// Set the history
    #[must_use]
    pub fn with_history(mut self, history: Vec<TraceEntry>) -> Self {
        self.history = history;
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    /// Set the model override
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Set the tool set
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<dyn ToolSet>) -> Self {
        self.tools = tools;
        self
    }

    /// Follow-up request: same system prompt and tools, this request's
    /// history extended with `accumulated`, and a new prompt
    #[must_use]
    pub fn continuation(&self, prompt: impl Into<String>, accumulated: &[TraceEntry]) -> Self {
        let mut history = self.history.clone();
        history.extend_from_slice(accumulated);
        Self {
            prompt: prompt.into(),
            history,
            system: self.system.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
        }
    }
}

impl std::fmt::Debug for BackendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRequest")
            .field("prompt", &self.prompt)
            .field("history_len", &self.history.len())
            .field("system", &self.system.is_some())
            .field("model", &self.model)
            .field("tools", &self.tools.definitions().len())
            .finish()
    }
}

/// Closed interface every backend implements
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Name the backend is selected by
    fn name(&self) -> &str;

    /// Start a streaming run
    async fn run_streaming(
        &self,
        request: &BackendRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError>;

    /// Run to completion
    async fn run_batch(&self, request: &BackendRequest) -> Result<BatchOutput, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_extends_history() {
        let request = BackendRequest::new("give me a diamond")
            .with_history(vec![TraceEntry::user("hi"), TraceEntry::assistant("hello")])
            .with_system(Some("be brief".into()));

        let accumulated = vec![
            TraceEntry::user("give me a diamond"),
            TraceEntry::tool_call("c1", "run_command", "{}"),
        ];
        let next = request.continuation("finish the tool call", &accumulated);

        assert_eq!(next.prompt, "finish the tool call");
        assert_eq!(next.history.len(), 4);
        assert_eq!(next.history[2], TraceEntry::user("give me a diamond"));
        assert_eq!(next.system.as_deref(), Some("be brief"));
        assert_eq!(request.history.len(), 2);
    }
}
