//! Ollama Backend Implementation
//!
//! Executor for Ollama's `/api/chat` endpoint with native tool calling.
//!
//! Each invocation runs up to `max_tool_rounds` tool rounds: the model's
//! tool calls are executed through the request's [`ToolSet`] and the results
//! are fed back. Calls requested after the round budget is spent are
//! recorded in the trace without a return, which leaves the chain
//! incomplete for the runner to finish.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::traits::{BackendExecutor, BackendRequest, BatchOutput, StreamingToken};
use crate::error::BackendError;
use crate::tools::{ToolCall, ToolDefinition, ToolSet};
use crate::trace::{MessageTrace, TraceEntry};

/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "llama3.2";

/// Tool rounds per invocation
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;

/// Convert a trace entry to an Ollama chat message
fn entry_to_message(entry: &TraceEntry) -> Option<Value> {
    match entry {
        TraceEntry::User { content } => Some(serde_json::json!({"role": "user", "content": content})),
        TraceEntry::Assistant { content } => {
            Some(serde_json::json!({"role": "assistant", "content": content}))
        }
        TraceEntry::Reasoning { .. } => None,
        TraceEntry::ToolCall {
            name, arguments, ..
        } => {
            let arguments: Value =
                serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}));
            Some(serde_json::json!({
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": name, "arguments": arguments}}]
            }))
        }
        TraceEntry::ToolReturn { content, .. } => {
            Some(serde_json::json!({"role": "tool", "content": content}))
        }
    }
}

fn build_messages(request: &BackendRequest) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    if let Some(ref system) = request.system {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    messages.extend(request.history.iter().filter_map(entry_to_message));
    messages.push(serde_json::json!({"role": "user", "content": request.prompt}));
    messages
}

fn parse_tool_calls(message: &Value, round: usize) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, call)| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = function
                        .get("arguments")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));
                    Some(ToolCall {
                        id: format!("call-{round}-{idx}"),
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn record_calls(trace: &mut MessageTrace, calls: &[ToolCall]) {
    for call in calls {
        trace.push(TraceEntry::tool_call(
            &call.id,
            &call.name,
            call.arguments.to_string(),
        ));
    }
}

/// Execute one round of tool calls, recording them in the trace and
/// appending the exchange to the chat messages
async fn run_tool_round(
    tools: &dyn ToolSet,
    content: &str,
    calls: &[ToolCall],
    messages: &mut Vec<Value>,
    trace: &mut MessageTrace,
) {
    record_calls(trace, calls);

    let raw_calls: Vec<Value> = calls
        .iter()
        .map(|call| serde_json::json!({"function": {"name": call.name, "arguments": call.arguments}}))
        .collect();
    messages.push(serde_json::json!({
        "role": "assistant",
        "content": content,
        "tool_calls": raw_calls
    }));

    for call in calls {
        let result = tools.invoke(call).await;
        trace.push(TraceEntry::tool_return(&call.id, &result));
        messages.push(serde_json::json!({
            "role": "tool",
            "content": result,
            "tool_name": call.name
        }));
    }
}

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Model identifier
    model: String,
    /// Tool rounds per invocation
    max_tool_rounds: usize,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        model: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            host: host.into(),
            port,
            model: model.into(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            http_client,
        })
    }

    /// Create from `OLLAMA_HOST`, `OLLAMA_PORT` and `RELAY_MODEL`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_env() -> Result<Self, BackendError> {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);
        let model = std::env::var("RELAY_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Self::new(host, port, model)
    }

    /// Set the tool round budget
    #[must_use]
    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Configured model
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Model for one request: the request's override or the configured one
    fn model_for<'a>(&'a self, request: &'a BackendRequest) -> &'a str {
        request.model.as_deref().unwrap_or(&self.model)
    }

    fn build_body(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> Value {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }

    async fn post_chat(&self, body: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self.http_client.post(self.chat_url()).json(body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }
        Ok(response)
    }

    /// One streamed round: forwards deltas and returns the round's text and
    /// tool calls. `Ok(None)` means the receiver went away.
    async fn stream_round(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[ToolDefinition],
        round: usize,
        trace: &mut MessageTrace,
        tx: &mpsc::Sender<StreamingToken>,
    ) -> Result<Option<(String, Vec<ToolCall>)>, BackendError> {
        let response = self.post_chat(&self.build_body(model, messages, tools, true)).await?;
        let mut stream = response.bytes_stream();

        let mut lines = LineDecoder::default();
        let mut content = String::new();
        let mut thinking = String::new();
        let mut calls = Vec::new();

        while let Some(chunk) = stream.next().await {
            lines.push(&chunk?);

            // Parse newline-delimited JSON
            while let Some(line) = lines.next_line()? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let data: Value =
                    serde_json::from_str(line).map_err(|e| BackendError::Decode(e.to_string()))?;
                if let Some(error) = data.get("error").and_then(Value::as_str) {
                    return Err(BackendError::Stream(error.to_string()));
                }

                if let Some(message) = data.get("message") {
                    if let Some(delta) = message.get("thinking").and_then(Value::as_str) {
                        if !delta.is_empty() {
                            thinking.push_str(delta);
                            if tx.send(StreamingToken::Reasoning(delta.to_string())).await.is_err() {
                                return Ok(None);
                            }
                        }
                    }
                    if let Some(delta) = message.get("content").and_then(Value::as_str) {
                        if !delta.is_empty() {
                            content.push_str(delta);
                            if tx.send(StreamingToken::Content(delta.to_string())).await.is_err() {
                                return Ok(None);
                            }
                        }
                    }
                    calls.extend(parse_tool_calls(message, round));
                }

                if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    if !thinking.is_empty() {
                        trace.push(TraceEntry::reasoning(thinking));
                    }
                    return Ok(Some((content, calls)));
                }
            }
        }

        Err(BackendError::StreamEnded)
    }

    async fn stream_all_rounds(
        &self,
        request: &BackendRequest,
        tx: &mpsc::Sender<StreamingToken>,
    ) -> Result<Option<(String, MessageTrace)>, BackendError> {
        let definitions = request.tools.definitions();
        let model = self.model_for(request);
        let mut messages = build_messages(request);
        let mut trace = MessageTrace::new();
        let mut text = String::new();

        for round in 0.. {
            let Some((content, calls)) = self
                .stream_round(model, &messages, &definitions, round, &mut trace, tx)
                .await?
            else {
                return Ok(None);
            };
            text.push_str(&content);

            if calls.is_empty() {
                trace.push(TraceEntry::assistant(content));
                break;
            }
            if !content.is_empty() {
                trace.push(TraceEntry::assistant(content.clone()));
            }
            if round >= self.max_tool_rounds {
                tracing::warn!(
                    rounds = round,
                    unanswered = calls.len(),
                    "Tool round budget exhausted"
                );
                record_calls(&mut trace, &calls);
                break;
            }
            run_tool_round(request.tools.as_ref(), &content, &calls, &mut messages, &mut trace).await;
        }

        Ok(Some((text, trace)))
    }
}

/// Splits a byte stream into newline-terminated lines. Bytes are decoded
/// only once a whole line is buffered, so a multi-byte character split
/// across HTTP chunks survives.
#[derive(Debug, Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Result<Option<String>, BackendError> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        let text = std::str::from_utf8(&line[..pos])
            .map_err(|e| BackendError::Decode(format!("invalid UTF-8 in stream: {e}")))?;
        Ok(Some(text.to_string()))
    }
}

#[async_trait]
impl BackendExecutor for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn run_streaming(
        &self,
        request: &BackendRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        let (tx, rx) = mpsc::channel(100);
        let backend = self.clone();
        let request = request.clone();

        // Spawn task to drive the rounds
        tokio::spawn(async move {
            match backend.stream_all_rounds(&request, &tx).await {
                Ok(Some((text, trace))) => {
                    let _ = tx.send(StreamingToken::Complete { text, trace }).await;
                }
                Ok(None) => {
                    // Receiver dropped, stop streaming
                }
                Err(e) => {
                    let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                }
            }
        });

        Ok(rx)
    }

    async fn run_batch(&self, request: &BackendRequest) -> Result<BatchOutput, BackendError> {
        let definitions = request.tools.definitions();
        let model = self.model_for(request);
        let mut messages = build_messages(request);
        let mut trace = MessageTrace::new();
        let mut text = String::new();

        for round in 0.. {
            let body = self.build_body(model, &messages, &definitions, false);
            let data: Value = self.post_chat(&body).await?.json().await?;
            let message = data
                .get("message")
                .ok_or_else(|| BackendError::Decode("response has no message".into()))?;

            if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
                if !thinking.is_empty() {
                    trace.push(TraceEntry::reasoning(thinking));
                }
            }
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            text.push_str(&content);

            let calls = parse_tool_calls(message, round);
            if calls.is_empty() {
                trace.push(TraceEntry::assistant(content));
                break;
            }
            if !content.is_empty() {
                trace.push(TraceEntry::assistant(content.clone()));
            }
            if round >= self.max_tool_rounds {
                tracing::warn!(
                    rounds = round,
                    unanswered = calls.len(),
                    "Tool round budget exhausted"
                );
                record_calls(&mut trace, &calls);
                break;
            }
            run_tool_round(request.tools.as_ref(), &content, &calls, &mut messages, &mut trace).await;
        }

        Ok(BatchOutput::new(text, trace))
    }
}
