//! Backend Executors
//!
//! Jobs are executed by a [`BackendExecutor`] looked up by name in a
//! [`BackendRegistry`].
//!
//! # Available Backends
//!
//! - **ollama**: local Ollama server over `/api/chat` with tool calling
//! - **echo**: deterministic [`ScriptedBackend`], also used by tests
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{BackendRegistry, BackendRequest, OllamaBackend};
//!
//! let registry = BackendRegistry::new("ollama")
//!     .with_backend(Arc::new(OllamaBackend::from_env()?));
//! let backend = registry.resolve(None)?;
//! let output = backend.run_batch(&BackendRequest::new("Hello!")).await?;
//! ```

mod ollama;
mod registry;
mod scripted;
mod traits;

pub use ollama::{OllamaBackend, DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_MODEL};
pub use registry::BackendRegistry;
pub use scripted::{ScriptedBackend, ECHO_BACKEND};
pub use traits::{BackendExecutor, BackendRequest, BatchOutput, StreamingToken};
