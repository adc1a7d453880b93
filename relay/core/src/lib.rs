//! Relay Core - Asynchronous Agent Job Broker
//!
//! Accepts chat jobs from many concurrent client connections, runs them
//! against pluggable agent backends on a bounded worker pool, and streams
//! ordered response events back to the connection that submitted each job.
//! When a backend issues tool calls it never completes, the runner re-invokes
//! it in batch mode until the tool chain is finished, delivering only text
//! the client has not seen yet.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Connections                              │
//! │   ConnectionSession ── submit_chat ──┐    ┌── delivery task ──►  │
//! └──────────────────────────────────────┼────┼──────────────────────┘
//!                                        │    │ EgressMessage
//! ┌──────────────────────────────────────┼────┼──────────────────────┐
//! │                  RequestBroker       ▼    │                      │
//! │   ingress queue (priority, FIFO)   egress queue per connection   │
//! │   pending acks ◄── request_action        history per connection  │
//! └──────────────────────────────────────┬───────────────────────────┘
//!                                        │ next()
//! ┌──────────────────────────────────────┼───────────────────────────┐
//! │   WorkerPool ── StreamingRunner ── BackendExecutor (by name)     │
//! │                  sentence flush  ·  tool-chain fallback          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`RequestBroker`]: ingress queue, per-connection egress, acknowledgements
//! - [`ConnectionSession`]: one client connection and its delivery task
//! - [`WorkerPool`]: concurrent job execution with timeout and panic isolation
//! - [`StreamingRunner`]: event emission and the tool-chain fallback loop
//! - [`BackendExecutor`]: the interface every backend implements
//! - [`ResponseEvent`]: one ordered piece of a job's output
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     BackendRegistry, ChannelSink, ConnectionSession, Priority, RequestBroker,
//!     ScriptedBackend, SessionConfig, StreamingRunner, WorkerConfig, WorkerPool,
//! };
//!
//! let broker = Arc::new(RequestBroker::default());
//! let registry = BackendRegistry::new("echo").with_backend(Arc::new(ScriptedBackend::echo()));
//! let pool = WorkerPool::start(
//!     broker.clone(),
//!     Arc::new(registry),
//!     Arc::new(StreamingRunner::default()),
//!     WorkerConfig::default(),
//! );
//!
//! let (sink, mut rx) = ChannelSink::new();
//! let session = ConnectionSession::open(broker.clone(), sink, &SessionConfig::default());
//! session.submit_chat("hello", Priority::NORMAL)?;
//! while let Some(message) = rx.recv().await {
//!     // forward to the client
//! }
//! pool.shutdown().await;
//! ```
//!
//! # Module Overview
//!
//! - [`broker`]: the request broker
//! - [`session`]: connection sessions, delivery, pending acknowledgements
//! - [`worker`]: the worker pool
//! - [`runner`]: streaming runner and fallback protocol
//! - [`backend`]: backend trait, registry, Ollama and scripted backends
//! - [`tools`]: tools offered to backends
//! - [`segment`]: sentence segmentation and batching
//! - [`history`]: per-connection conversation history
//! - [`job`], [`event`], [`trace`]: data model
//! - [`config`]: TOML, environment and CLI configuration
//! - [`error`]: error types

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod history;
pub mod job;
pub mod runner;
pub mod segment;
pub mod session;
pub mod tools;
pub mod trace;
pub mod worker;

// Re-exports for convenience
pub use backend::{
    BackendExecutor, BackendRegistry, BackendRequest, BatchOutput, OllamaBackend,
    ScriptedBackend, StreamingToken,
};
pub use broker::{BrokerConfig, BrokerStats, EgressQueue, RequestBroker};
pub use error::{BackendError, BrokerError, JobFailure, SessionClosedError};
pub use event::{
    ActionRequest, EgressMessage, EventKind, EventMetadata, Notice, NoticeLevel, ResponseEvent,
};
pub use history::HistoryStore;
pub use job::{ChatJob, ConnectionId, HistoryRef, JobId, JobState, Priority};
pub use trace::{MessageTrace, ToolInvocationRecord, TraceEntry};

// Execution exports
pub use runner::{
    dedup_suffix, ChainStatus, JobEmitter, RunMode, RunOutcome, RunnerConfig, StreamingRunner,
};
pub use segment::{iter_sentence_batches, split_sentences, SentenceBuffer};
pub use worker::{WorkerConfig, WorkerPool};

// Session exports
pub use session::{
    AckOutcome, ChannelSink, ConnectionSession, ConnectionSink, DeliveryReport, PendingAck,
    PendingAcks, SessionConfig, SessionState, SinkError,
};

// Tool exports
pub use tools::{ConnectionTools, NoTools, ToolCall, ToolDefinition, ToolSet};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BackendSettings, ConfigError,
    ConfigOverrides, ConfigSource, RelayConfig, RelayToml,
};
