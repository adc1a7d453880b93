//! Scripted backend
//!
//! Deterministic executor that replays queued scripts and counts how often
//! it was invoked. With nothing queued it echoes the prompt; a prompt that
//! starts with `/` is run through the request's `run_command` tool first,
//! which exercises the action round-trip end to end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{BackendExecutor, BackendRequest, BatchOutput, StreamingToken};
use crate::error::BackendError;
use crate::tools::{ToolCall, RUN_COMMAND_TOOL};
use crate::trace::{MessageTrace, TraceEntry};

/// Name used by [`ScriptedBackend::echo`]
pub const ECHO_BACKEND: &str = "echo";

/// Programmable backend
pub struct ScriptedBackend {
    name: String,
    streams: Mutex<VecDeque<Vec<StreamingToken>>>,
    batches: Mutex<VecDeque<BatchOutput>>,
    last_batch: Mutex<Option<BatchOutput>>,
    streaming_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// Empty script under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            streams: Mutex::new(VecDeque::new()),
            batches: Mutex::new(VecDeque::new()),
            last_batch: Mutex::new(None),
            streaming_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Echo backend registered as `echo`
    #[must_use]
    pub fn echo() -> Self {
        Self::new(ECHO_BACKEND)
    }

    /// Queue a streaming run made of `chunks`, completed with `trace`
    #[must_use]
    pub fn with_stream(self, chunks: &[&str], trace: MessageTrace) -> Self {
        let mut tokens: Vec<StreamingToken> = chunks
            .iter()
            .map(|chunk| StreamingToken::Content((*chunk).to_string()))
            .collect();
        tokens.push(StreamingToken::Complete {
            text: chunks.concat(),
            trace,
        });
        self.with_stream_tokens(tokens)
    }

    /// Queue a streaming run with raw tokens
    #[must_use]
    pub fn with_stream_tokens(self, tokens: Vec<StreamingToken>) -> Self {
        self.streams.lock().push_back(tokens);
        self
    }

    /// Queue a batch run. Once the queue is exhausted the last batch
    /// script repeats.
    #[must_use]
    pub fn with_batch(self, text: impl Into<String>, trace: MessageTrace) -> Self {
        self.batches.lock().push_back(BatchOutput::new(text, trace));
        self
    }

    /// Streaming invocations so far
    #[must_use]
    pub fn streaming_calls(&self) -> usize {
        self.streaming_calls.load(Ordering::SeqCst)
    }

    /// Batch invocations so far
    #[must_use]
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn next_batch(&self) -> Option<BatchOutput> {
        let queued = self.batches.lock().pop_front();
        let mut last = self.last_batch.lock();
        match queued {
            Some(output) => {
                *last = Some(output.clone());
                Some(output)
            }
            None => last.clone(),
        }
    }

    async fn echo_output(request: &BackendRequest) -> BatchOutput {
        if !request.prompt.starts_with('/') {
            return BatchOutput::new(
                request.prompt.clone(),
                MessageTrace::from_entries(vec![TraceEntry::assistant(request.prompt.clone())]),
            );
        }

        let call = ToolCall {
            id: "echo-1".to_string(),
            name: RUN_COMMAND_TOOL.to_string(),
            arguments: serde_json::json!({ "command": request.prompt }),
        };
        let result = request.tools.invoke(&call).await;
        let trace = MessageTrace::from_entries(vec![
            TraceEntry::tool_call(&call.id, &call.name, call.arguments.to_string()),
            TraceEntry::tool_return(&call.id, &result),
            TraceEntry::assistant(&result),
        ]);
        BatchOutput::new(result, trace)
    }
}

#[async_trait]
impl BackendExecutor for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_streaming(
        &self,
        request: &BackendRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        self.streaming_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());

        let queued = self.streams.lock().pop_front();
        let tokens = match queued {
            Some(tokens) => tokens,
            None => {
                let output = Self::echo_output(request).await;
                let mut tokens: Vec<StreamingToken> = output
                    .text
                    .split_inclusive(' ')
                    .map(|word| StreamingToken::Content(word.to_string()))
                    .collect();
                tokens.push(StreamingToken::Complete {
                    text: output.text,
                    trace: output.trace,
                });
                tokens
            }
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for token in tokens {
                if tx.send(token).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn run_batch(&self, request: &BackendRequest) -> Result<BatchOutput, BackendError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());

        match self.next_batch() {
            Some(output) => Ok(output),
            None => Ok(Self::echo_output(request).await),
        }
    }
}
