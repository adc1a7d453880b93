//! TOML Configuration File Support
//!
//! Configuration is read from `~/.config/relay/relay.toml`, then overridden
//! by environment variables, then by command-line flags through
//! [`ConfigOverrides`].
//!
//! # Configuration Priority
//!
//! 1. CLI arguments
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [broker]
//! queue_capacity = 100
//! worker_count = 2
//! job_timeout_secs = 120
//! action_timeout_secs = 10
//!
//! [session]
//! delivery_poll_ms = 1000
//!
//! [runner]
//! mode = "streaming"
//! max_fallback_attempts = 3
//! max_batch_chars = 800
//! enable_reasoning_output = true
//!
//! [history]
//! max_turns = 20
//!
//! [backend]
//! default = "ollama"
//! host = "localhost"
//! port = 11434
//! model = "llama3.2"
//! max_tool_rounds = 4
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_MODEL};
use crate::broker::BrokerConfig;
use crate::runner::{RunMode, RunnerConfig};
use crate::session::SessionConfig;
use crate::worker::WorkerConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the configuration last changed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in default
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[broker]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerToml {
    /// Maximum queued jobs
    pub queue_capacity: Option<usize>,
    /// Concurrent workers
    pub worker_count: Option<usize>,
    /// Hard limit per job in seconds
    pub job_timeout_secs: Option<u64>,
    /// Acknowledgement wait in seconds
    pub action_timeout_secs: Option<u64>,
}

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Delivery task poll interval in milliseconds
    pub delivery_poll_ms: Option<u64>,
    /// Whether new sessions keep conversation context
    pub use_context: Option<bool>,
}

/// `[runner]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerToml {
    /// `streaming` or `batch`
    pub mode: Option<RunMode>,
    /// Bound on fallback invocations
    pub max_fallback_attempts: Option<u32>,
    /// Characters per delivered batch
    pub max_batch_chars: Option<usize>,
    /// Forward reasoning deltas
    pub enable_reasoning_output: Option<bool>,
    /// Fallback instruction
    pub continuation_prompt: Option<String>,
}

/// `[history]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryToml {
    /// Turns kept per connection
    pub max_turns: Option<usize>,
}

/// `[backend]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Backend used when a job names none
    pub default: Option<String>,
    /// Ollama host
    pub host: Option<String>,
    /// Ollama port
    pub port: Option<u16>,
    /// Model name
    pub model: Option<String>,
    /// System prompt for every request
    pub system_prompt: Option<String>,
    /// Tool rounds per invocation
    pub max_tool_rounds: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// `[broker]`
    pub broker: BrokerToml,
    /// `[session]`
    pub session: SessionToml,
    /// `[runner]`
    pub runner: RunnerToml,
    /// `[history]`
    pub history: HistoryToml,
    /// `[backend]`
    pub backend: BackendToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Backend selection and Ollama connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSettings {
    /// Backend used when a job names none
    pub default: String,
    /// Ollama host
    pub host: String,
    /// Ollama port
    pub port: u16,
    /// Model name
    pub model: String,
    /// System prompt for every request
    pub system_prompt: Option<String>,
    /// Tool rounds per invocation
    pub max_tool_rounds: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            default: "ollama".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

/// Resolved configuration for the whole relay
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    /// Broker settings
    pub broker: BrokerConfig,
    /// Worker pool settings
    pub worker: WorkerConfig,
    /// Session settings
    pub session: SessionConfig,
    /// Runner settings
    pub runner: RunnerConfig,
    /// Backend settings
    pub backend: BackendSettings,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl RelayConfig {
    /// Configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the configuration last changed
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the relay cannot run with
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "broker.queue_capacity must be at least 1".into(),
            ));
        }
        if self.worker.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "broker.worker_count must be at least 1".into(),
            ));
        }
        if self.runner.max_batch_chars == 0 {
            return Err(ConfigError::ValidationError(
                "runner.max_batch_chars must be at least 1".into(),
            ));
        }
        if self.worker.job_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "broker.job_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path, `$XDG_CONFIG_HOME/relay/relay.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.set_source(ConfigSource::File);

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    // Broker settings
    if let Some(capacity) = toml.broker.queue_capacity {
        config.broker.queue_capacity = capacity;
    }
    if let Some(count) = toml.broker.worker_count {
        config.worker.worker_count = count;
    }
    if let Some(secs) = toml.broker.job_timeout_secs {
        config.worker.job_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.broker.action_timeout_secs {
        config.worker.action_timeout = Duration::from_secs(secs);
    }

    // Session settings
    if let Some(ms) = toml.session.delivery_poll_ms {
        config.session.delivery_poll = Duration::from_millis(ms);
    }
    if let Some(enabled) = toml.session.use_context {
        config.session.use_context = enabled;
    }

    // Runner settings
    if let Some(mode) = toml.runner.mode {
        config.runner.mode = mode;
    }
    if let Some(attempts) = toml.runner.max_fallback_attempts {
        config.runner.max_fallback_attempts = attempts;
    }
    if let Some(chars) = toml.runner.max_batch_chars {
        config.runner.max_batch_chars = chars;
    }
    if let Some(enabled) = toml.runner.enable_reasoning_output {
        config.runner.enable_reasoning_output = enabled;
    }
    if let Some(ref prompt) = toml.runner.continuation_prompt {
        config.runner.continuation_prompt.clone_from(prompt);
    }

    if let Some(turns) = toml.history.max_turns {
        config.broker.max_history_turns = turns;
    }

    // Backend settings
    if let Some(ref name) = toml.backend.default {
        config.backend.default.clone_from(name);
    }
    if let Some(ref host) = toml.backend.host {
        config.backend.host.clone_from(host);
    }
    if let Some(port) = toml.backend.port {
        config.backend.port = port;
    }
    if let Some(ref model) = toml.backend.model {
        config.backend.model.clone_from(model);
    }
    if toml.backend.system_prompt.is_some() {
        config.backend.system_prompt.clone_from(&toml.backend.system_prompt);
        config.worker.system_prompt.clone_from(&toml.backend.system_prompt);
    }
    if let Some(rounds) = toml.backend.max_tool_rounds {
        config.backend.max_tool_rounds = rounds;
    }
}

fn apply_env_config(config: &mut RelayConfig, env: impl Fn(&str) -> Option<String>) {
    let mut touched = false;

    if let Some(n) = env("RELAY_QUEUE_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
        config.broker.queue_capacity = n;
        touched = true;
    }
    if let Some(n) = env("RELAY_WORKERS").and_then(|v| v.parse::<usize>().ok()) {
        config.worker.worker_count = n;
        touched = true;
    }
    if let Some(secs) = env("RELAY_JOB_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
        config.worker.job_timeout = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(mode) = env("RELAY_STREAM_MODE").and_then(|v| v.parse::<RunMode>().ok()) {
        config.runner.mode = mode;
        touched = true;
    }
    if let Some(n) = env("RELAY_MAX_FALLBACK").and_then(|v| v.parse::<u32>().ok()) {
        config.runner.max_fallback_attempts = n;
        touched = true;
    }
    if let Some(name) = env("RELAY_BACKEND") {
        config.backend.default = name;
        touched = true;
    }
    if let Some(model) = env("RELAY_MODEL") {
        config.backend.model = model;
        touched = true;
    }
    if let Some(host) = env("OLLAMA_HOST") {
        config.backend.host = host;
        touched = true;
    }
    if let Some(port) = env("OLLAMA_PORT").and_then(|v| v.parse::<u16>().ok()) {
        config.backend.port = port;
        touched = true;
    }

    if touched {
        config.set_source(ConfigSource::Env);
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Worker count override
    pub worker_count: Option<usize>,
    /// Default backend override
    pub backend: Option<String>,
    /// Run mode override
    pub mode: Option<RunMode>,
    /// Model override
    pub model: Option<String>,
}

impl ConfigOverrides {
    /// Empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Set the default backend
    #[must_use]
    pub fn with_backend(mut self, name: String) -> Self {
        self.backend = Some(name);
        self
    }

    /// Set the run mode
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Validation fails again if an override produced an invalid value.
    pub fn apply(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        if self.worker_count.is_some()
            || self.backend.is_some()
            || self.mode.is_some()
            || self.model.is_some()
        {
            config.set_source(ConfigSource::Cli);
        }

        if let Some(count) = self.worker_count {
            config.worker.worker_count = count;
        }
        if let Some(ref name) = self.backend {
            config.backend.default.clone_from(name);
        }
        if let Some(mode) = self.mode {
            config.runner.mode = mode;
        }
        if let Some(ref model) = self.model {
            config.backend.model.clone_from(model);
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
