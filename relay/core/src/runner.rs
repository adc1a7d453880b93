//! Streaming Runner
//!
//! Executes one job against one backend and turns the result into response
//! events, then makes sure the backend's tool chain was finished.
//!
//! # Tool-chain completion
//!
//! After the primary invocation the runner counts tool calls and returns in
//! its trace. If a call is left unanswered the job is `Incomplete` and the
//! runner re-invokes the backend in batch mode with the accumulated exchange
//! plus a continuation instruction. Each fallback output `F` is compared with
//! the text `S` already sent: if `F` starts with `S` only the remainder is
//! emitted, otherwise nothing is. The loop stops as soon as a chain is
//! complete or after `max_fallback_attempts` invocations.
//!
//! In batch mode the primary text is withheld while the chain is incomplete,
//! so the fallback output is delivered whole.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendExecutor, BackendRequest, StreamingToken};
use crate::broker::RequestBroker;
use crate::error::BackendError;
use crate::event::{EgressMessage, EventKind, EventMetadata, ResponseEvent};
use crate::job::{ChatJob, ConnectionId, HistoryRef, JobId, JobState};
use crate::segment::{iter_sentence_batches, SentenceBuffer, DEFAULT_MAX_BATCH_CHARS};
use crate::trace::{MessageTrace, ToolInvocationRecord, TraceEntry};

/// Default bound on fallback invocations per job
pub const MAX_FALLBACK_ATTEMPTS: u32 = 3;

/// Instruction sent with every fallback invocation
pub const DEFAULT_CONTINUATION_PROMPT: &str = "Your previous reply issued a tool call that was \
never completed. Finish every pending tool call now, then give the user your complete final \
answer, starting with the exact text you already wrote.";

/// How the primary invocation is executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Forward text sentence by sentence as it is generated
    #[default]
    Streaming,
    /// Wait for the full text, then deliver it in sentence batches
    Batch,
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "streaming" | "stream" | "1" | "true" => Ok(Self::Streaming),
            "batch" | "0" | "false" => Ok(Self::Batch),
            other => Err(format!("unknown run mode '{other}'")),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Whether every tool call of a run was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// `calls <= returns`
    Complete,
    /// At least one call is unanswered
    Incomplete,
}

impl From<ToolInvocationRecord> for ChainStatus {
    fn from(record: ToolInvocationRecord) -> Self {
        if record.is_complete() {
            Self::Complete
        } else {
            Self::Incomplete
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Primary execution mode
    pub mode: RunMode,
    /// Bound on fallback invocations
    pub max_fallback_attempts: u32,
    /// Character budget per delivered batch
    pub max_batch_chars: usize,
    /// Forward reasoning deltas
    pub enable_reasoning_output: bool,
    /// Instruction for fallback invocations
    pub continuation_prompt: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Streaming,
            max_fallback_attempts: MAX_FALLBACK_ATTEMPTS,
            max_batch_chars: DEFAULT_MAX_BATCH_CHARS,
            enable_reasoning_output: true,
            continuation_prompt: DEFAULT_CONTINUATION_PROMPT.to_string(),
        }
    }
}

/// Text of `fallback` not yet delivered, given that `sent` was.
///
/// If `fallback` does not extend `sent` the result is empty: a fallback
/// that rewrites delivered text can never duplicate it.
#[must_use]
pub fn dedup_suffix<'a>(fallback: &'a str, sent: &str) -> &'a str {
    fallback.strip_prefix(sent).unwrap_or("")
}

// ============================================================================
// Emitter
// ============================================================================

/// Publishes a job's events with gap-free sequence numbers
///
/// Clones share the sequence counter, so the worker can still emit a
/// terminal error after the runner task died. Nothing is emitted after a
/// final event.
#[derive(Clone)]
pub struct JobEmitter {
    broker: Arc<RequestBroker>,
    job_id: JobId,
    connection_id: ConnectionId,
    sequence: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
}

impl JobEmitter {
    /// Emitter for `job`
    #[must_use]
    pub fn new(broker: Arc<RequestBroker>, job: &ChatJob) -> Self {
        Self {
            broker,
            job_id: job.id,
            connection_id: job.connection_id,
            sequence: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    fn emit(
        &self,
        kind: EventKind,
        text: String,
        is_final: bool,
        metadata: Option<EventMetadata>,
    ) -> Option<u64> {
        if is_final {
            if self.finished.swap(true, Ordering::SeqCst) {
                return None;
            }
        } else if self.finished.load(Ordering::SeqCst) {
            return None;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = ResponseEvent {
            job_id: self.job_id,
            sequence,
            kind,
            text,
            is_final,
            metadata,
        };
        self.broker
            .publish(self.connection_id, EgressMessage::Event(event));
        Some(sequence)
    }

    /// Emit a content delta
    pub fn content(&self, text: impl Into<String>) -> Option<u64> {
        self.emit(EventKind::ContentDelta, text.into(), false, None)
    }

    /// Emit a reasoning delta
    pub fn reasoning(&self, text: impl Into<String>) -> Option<u64> {
        self.emit(EventKind::ReasoningDelta, text.into(), false, None)
    }

    /// Emit the terminal success event
    pub fn done(&self, metadata: EventMetadata) -> Option<u64> {
        self.emit(EventKind::Done, String::new(), true, Some(metadata))
    }

    /// Emit the terminal error event
    pub fn error(&self, text: impl Into<String>, metadata: EventMetadata) -> Option<u64> {
        self.emit(EventKind::Error, text.into(), true, Some(metadata))
    }

    /// Whether a final event has been emitted
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Events emitted so far
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Job the emitter belongs to
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// All visible text delivered for the job
    pub delivered: String,
    /// Metadata carried by the `done` event
    pub metadata: EventMetadata,
    /// Entries produced by the job, starting with its prompt
    pub entries: Vec<TraceEntry>,
}

/// Primary invocation result
struct Primary {
    text: String,
    trace: MessageTrace,
    sent: String,
}

/// Runs jobs against backends
#[derive(Debug, Clone, Default)]
pub struct StreamingRunner {
    config: RunnerConfig,
}

impl StreamingRunner {
    /// Create a runner
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Runner configuration
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn emit_batches(&self, emitter: &JobEmitter, text: &str) {
        for batch in iter_sentence_batches(text, self.config.max_batch_chars) {
            emitter.content(batch);
        }
    }

    /// Execute `job` and emit its events, ending with `done`
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] from the primary or a fallback invocation. No
    /// final event has been emitted in that case.
    pub async fn run(
        &self,
        broker: &RequestBroker,
        backend: &dyn BackendExecutor,
        job: &ChatJob,
        request: BackendRequest,
        emitter: &JobEmitter,
    ) -> Result<RunOutcome, BackendError> {
        broker.set_job_state(job.id, JobState::Executing);

        let primary = match self.config.mode {
            RunMode::Streaming => self.run_primary_streaming(backend, &request, emitter).await?,
            RunMode::Batch => self.run_primary_batch(backend, &request, emitter).await?,
        };

        let mut entries = vec![TraceEntry::user(job.prompt.clone())];
        entries.extend(primary.trace.entries().iter().cloned());
        let mut record = primary.trace.tool_counts();
        let mut status = ChainStatus::from(record);
        let mut sent = primary.sent;
        let mut attempts = 0;

        if status == ChainStatus::Incomplete {
            broker.set_job_state(job.id, JobState::Incomplete);
            tracing::info!(
                job_id = %job.id,
                calls = record.calls,
                returns = record.returns,
                "Tool chain incomplete, running fallback"
            );

            while status == ChainStatus::Incomplete
                && attempts < self.config.max_fallback_attempts
            {
                attempts += 1;
                broker.set_job_state(job.id, JobState::FallbackExecuting);

                let continuation = request.continuation(&self.config.continuation_prompt, &entries);
                let output = backend.run_batch(&continuation).await?;

                entries.push(TraceEntry::user(self.config.continuation_prompt.clone()));
                entries.extend(output.trace.entries().iter().cloned());
                record = output.trace.tool_counts();
                status = ChainStatus::from(record);

                let suffix = dedup_suffix(&output.text, &sent);
                if suffix.is_empty() && !output.text.is_empty() && output.text != sent {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = attempts,
                        "Fallback output does not extend delivered text, nothing emitted"
                    );
                }
                if !suffix.is_empty() {
                    self.emit_batches(emitter, suffix);
                    sent.push_str(suffix);
                }

                tracing::debug!(
                    job_id = %job.id,
                    attempt = attempts,
                    calls = record.calls,
                    returns = record.returns,
                    "Fallback attempt finished"
                );
                if status == ChainStatus::Incomplete {
                    broker.set_job_state(job.id, JobState::Incomplete);
                }
            }

            if status == ChainStatus::Incomplete {
                tracing::warn!(
                    job_id = %job.id,
                    attempts = attempts,
                    "Tool chain still incomplete after fallback budget"
                );
                if sent.is_empty() && !primary.text.is_empty() {
                    // Best effort: release the withheld primary text
                    self.emit_batches(emitter, &primary.text);
                    sent.push_str(&primary.text);
                }
            }
        }

        let metadata = self.metadata(record, attempts);

        if let HistoryRef::Conversation(id) = job.history_ref {
            broker.append_history(id, entries.clone());
        }
        emitter.done(metadata.clone());

        Ok(RunOutcome {
            delivered: sent,
            metadata,
            entries,
        })
    }

    fn metadata(&self, record: ToolInvocationRecord, attempts: u32) -> EventMetadata {
        EventMetadata {
            tool_fallback_used: attempts > 0,
            attempts,
            chain_complete: record.is_complete(),
            tool_calls: record.calls,
            tool_returns: record.returns,
            mode: Some(self.config.mode),
            failure: None,
        }
    }

    async fn run_primary_streaming(
        &self,
        backend: &dyn BackendExecutor,
        request: &BackendRequest,
        emitter: &JobEmitter,
    ) -> Result<Primary, BackendError> {
        let mut rx = backend.run_streaming(request).await?;
        let mut buffer = SentenceBuffer::new(self.config.max_batch_chars);
        let mut sent = String::new();

        let (text, trace) = loop {
            match rx.recv().await {
                Some(StreamingToken::Content(delta)) => {
                    for sentence in buffer.push(&delta) {
                        sent.push_str(&sentence);
                        emitter.content(sentence);
                    }
                }
                Some(StreamingToken::Reasoning(delta)) => {
                    if self.config.enable_reasoning_output {
                        emitter.reasoning(delta);
                    }
                }
                Some(StreamingToken::Complete { text, trace }) => break (text, trace),
                Some(StreamingToken::Error(e)) => return Err(BackendError::Stream(e)),
                None => return Err(BackendError::StreamEnded),
            }
        };

        if let Some(rest) = buffer.finish() {
            sent.push_str(&rest);
            emitter.content(rest);
        }

        Ok(Primary { text, trace, sent })
    }

    async fn run_primary_batch(
        &self,
        backend: &dyn BackendExecutor,
        request: &BackendRequest,
        emitter: &JobEmitter,
    ) -> Result<Primary, BackendError> {
        let output = backend.run_batch(request).await?;

        if self.config.enable_reasoning_output {
            for entry in output.trace.entries() {
                if let TraceEntry::Reasoning { content } = entry {
                    emitter.reasoning(content.clone());
                }
            }
        }

        let sent = if output.trace.is_chain_complete() {
            self.emit_batches(emitter, &output.text);
            output.text.clone()
        } else {
            String::new()
        };

        Ok(Primary {
            text: output.text,
            trace: output.trace,
            sent,
        })
    }
}
