//! Daemon Server Implementation
//!
//! Accepts WebSocket connections, opens one [`ConnectionSession`] per
//! connection and translates inbound frames into session operations.
//!
//! ```text
//!                     RelayServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       client          client          client
//!       (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                    RequestBroker
//!                  (shared, Arc-owned)
//! ```

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn, Instrument};

use relay_core::{
    BackendRegistry, BrokerError, ConnectionId, ConnectionSession, ConnectionSink, EgressMessage,
    NoticeLevel, RequestBroker, SessionConfig, SinkError,
};

use crate::protocol::{self, InboundFrame};

/// Connection bookkeeping kept by the server
struct ConnectionState {
    connected_at: std::time::Instant,
    peer: std::net::SocketAddr,
    abort_handle: tokio::task::AbortHandle,
}

/// Server limits
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
        }
    }
}

/// Write half of a WebSocket connection
struct WsSink {
    write: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl ConnectionSink for WsSink {
    async fn send(&mut self, message: &EgressMessage) -> Result<(), SinkError> {
        let text = protocol::encode(message).map_err(|e| SinkError(e.to_string()))?;
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}

/// The WebSocket front end
pub struct RelayServer {
    broker: Arc<RequestBroker>,
    backends: Arc<BackendRegistry>,
    session_config: SessionConfig,
    server_config: ServerConfig,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl RelayServer {
    /// Create a server over a shared broker
    pub fn new(
        broker: Arc<RequestBroker>,
        backends: Arc<BackendRegistry>,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            broker,
            backends,
            session_config,
            server_config: ServerConfig::default(),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Replace the server limits
    #[must_use]
    pub fn with_server_config(mut self, config: ServerConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        info!(addr = %addr, "Listening for connections");

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if self.connections.len() >= self.server_config.max_connections {
                warn!(peer = %peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            let handler = ConnectionHandler {
                conn_id,
                broker: self.broker.clone(),
                backends: self.backends.clone(),
                session_config: self.session_config.clone(),
                connections: self.connections.clone(),
            };
            let task = tokio::spawn(
                handler
                    .run(stream)
                    .instrument(tracing::info_span!("connection", connection_id = %conn_id)),
            );
            self.connections.insert(
                conn_id,
                ConnectionState {
                    connected_at: std::time::Instant::now(),
                    peer,
                    abort_handle: task.abort_handle(),
                },
            );

            info!(
                connection_id = %conn_id,
                peer = %peer,
                active_connections = self.connections.len(),
                "New connection accepted"
            );
        }

        self.shutdown();
        Ok(())
    }

    /// Abort every connection handler. Dropping a handler closes its
    /// session, which releases its pending acknowledgements.
    fn shutdown(&self) {
        info!(connections = self.connections.len(), "Closing connections");
        let conn_ids: Vec<ConnectionId> = self.connections.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connections.remove(&conn_id) {
                debug!(
                    connection_id = %conn_id,
                    peer = %state.peer,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }
    }
}

/// Per-connection task
struct ConnectionHandler {
    conn_id: ConnectionId,
    broker: Arc<RequestBroker>,
    backends: Arc<BackendRegistry>,
    session_config: SessionConfig,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl ConnectionHandler {
    async fn run(self, stream: TcpStream) {
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => self.serve(ws).await,
            Err(e) => warn!(error = %e, "WebSocket handshake failed"),
        }
        self.connections.remove(&self.conn_id);
        info!(
            active_connections = self.connections.len(),
            "Connection handler finished"
        );
    }

    async fn serve(&self, ws: WebSocketStream<TcpStream>) {
        let (write, mut read) = ws.split();
        let session = ConnectionSession::open_with_id(
            self.conn_id,
            self.broker.clone(),
            WsSink { write },
            &self.session_config,
        );

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_text(&session, &text),
                Ok(Message::Close(_)) => {
                    info!("Client disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Read error");
                    break;
                }
            }
        }

        session.close();
        if let Some(report) = session.closed().await {
            info!(
                delivered = report.delivered,
                discarded = report.discarded,
                released_acks = report.released_acks,
                "Session closed"
            );
        }
    }

    fn handle_text(&self, session: &ConnectionSession, text: &str) {
        let frame = match protocol::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Rejected inbound frame");
                session.notify(NoticeLevel::Warn, e.to_string());
                return;
            }
        };

        let priority = frame.priority();
        match frame {
            InboundFrame::Chat { prompt, .. } => match session.submit_chat(prompt, priority) {
                Ok(job_id) => debug!(job_id = %job_id, "Chat submitted"),
                Err(BrokerError::Backpressure { capacity }) => {
                    session.notify(
                        NoticeLevel::Warn,
                        format!("server busy ({capacity} jobs queued), try again shortly"),
                    );
                }
                Err(e) => {
                    session.notify(NoticeLevel::Error, e.to_string());
                }
            },
            InboundFrame::Ack {
                correlation_id,
                success,
                message,
            } => {
                let outcome = protocol::ack_outcome(success, message);
                if !session.resolve_pending(&correlation_id, outcome) {
                    debug!(correlation_id = %correlation_id, "Ack for unknown correlation id");
                }
            }
            InboundFrame::Context { enabled } => {
                session.set_context_enabled(enabled);
                let state = if enabled { "enabled" } else { "disabled" };
                session.notify(NoticeLevel::Info, format!("conversation context {state}"));
            }
            InboundFrame::Backend { name } => match name {
                Some(name) if !self.backends.contains(&name) => {
                    session.notify(
                        NoticeLevel::Warn,
                        format!(
                            "unknown backend '{name}', available: {}",
                            self.backends.names().join(", ")
                        ),
                    );
                }
                name => {
                    let label = name
                        .clone()
                        .unwrap_or_else(|| self.backends.default_name().to_string());
                    session.set_backend(name);
                    session.notify(NoticeLevel::Info, format!("backend set to {label}"));
                }
            },
        }
    }
}
