//! Relay Daemon - WebSocket front end for the job broker
//!
//! Clients connect over WebSocket, submit chat prompts and receive ordered
//! response events for their own jobs. Commands the backend wants run on the
//! client side arrive as action frames and are answered with ack frames.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (ws://127.0.0.1:8765, backend from config)
//! relay-daemon
//!
//! # Deterministic echo backend, batch delivery
//! relay-daemon --backend echo --mode batch
//!
//! # With config file
//! relay-daemon --config /etc/relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod protocol;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use relay_core::config::{load_config, load_config_from_path, ConfigOverrides, RelayConfig};
use relay_core::{
    BackendRegistry, OllamaBackend, RequestBroker, RunMode, ScriptedBackend, StreamingRunner,
    WorkerPool,
};

use server::{RelayServer, ServerConfig};

/// Relay Daemon - asynchronous agent job broker over WebSocket
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(short = 'L', long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8765")]
    listen: SocketAddr,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Number of concurrent workers
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Default backend (ollama, echo)
    #[arg(short = 'b', long)]
    backend: Option<String>,

    /// Delivery mode (streaming, batch)
    #[arg(short = 'm', long)]
    mode: Option<RunMode>,

    /// Model for the Ollama backend
    #[arg(long)]
    model: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(count) = self.workers {
            overrides = overrides.with_worker_count(count);
        }
        if let Some(ref name) = self.backend {
            overrides = overrides.with_backend(name.clone());
        }
        if let Some(mode) = self.mode {
            overrides = overrides.with_mode(mode);
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_model(model.clone());
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Register the built-in backends
fn build_registry(config: &RelayConfig) -> Result<BackendRegistry> {
    let settings = &config.backend;
    let ollama = OllamaBackend::new(&settings.host, settings.port, &settings.model)
        .context("Failed to create Ollama backend")?
        .with_max_tool_rounds(settings.max_tool_rounds);

    let registry = BackendRegistry::new(&settings.default)
        .with_backend(Arc::new(ScriptedBackend::echo()))
        .with_backend(Arc::new(ollama));

    if !registry.contains(&settings.default) {
        anyhow::bail!(
            "Default backend '{}' is not available (choose from: {})",
            settings.default,
            registry.names().join(", ")
        );
    }
    Ok(registry)
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("Received SIGINT, initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config {
        Some(ref path) => load_config_from_path(Some(path.clone())),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;

    info!(
        source = %config.source(),
        workers = config.worker.worker_count,
        mode = %config.runner.mode,
        backend = %config.backend.default,
        queue_capacity = config.broker.queue_capacity,
        "Configuration loaded"
    );

    let backends = Arc::new(build_registry(&config)?);
    let broker = Arc::new(RequestBroker::new(config.broker.clone()));
    let pool = WorkerPool::start(
        broker.clone(),
        backends.clone(),
        Arc::new(StreamingRunner::new(config.runner.clone())),
        config.worker.clone(),
    );

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", args.listen))?;

    let server = RelayServer::new(broker.clone(), backends, config.session.clone())
        .with_server_config(ServerConfig {
            max_connections: args.max_connections,
        });
    let result = server.run(listener, shutdown_signal()).await;

    info!(
        open_connections = server.connection_count(),
        "Shutting down workers..."
    );
    pool.shutdown().await;

    let stats = broker.stats();
    match result {
        Ok(()) => {
            info!(
                completed = stats.completed,
                failed = stats.failed,
                rejected = stats.rejected,
                "Relay daemon stopped cleanly"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
