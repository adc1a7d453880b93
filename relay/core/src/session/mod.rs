//! Connection Sessions
//!
//! A [`ConnectionSession`] binds one live connection to the broker. It owns
//! the connection's egress queue (read only by its delivery task) and its
//! pending-acknowledgement table.
//!
//! # Lifecycle
//!
//! ```text
//!   open() ──▶ Active ──close()──▶ Draining ──queue drained──▶ Closed
//!                │
//!                └── write failure / peer gone ─────────────▶ Closed
//! ```
//!
//! Closing never cancels work already running for the connection; that
//! output is dropped by the broker once the session is unregistered.

mod delivery;
pub mod pending;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

pub use delivery::{ChannelSink, ConnectionSink, DeliveryReport, SinkError};
pub use pending::{AckOutcome, PendingAck, PendingAcks};

use crate::broker::RequestBroker;
use crate::error::BrokerError;
use crate::event::{EgressMessage, Notice, NoticeLevel};
use crate::job::{ChatJob, ConnectionId, HistoryRef, JobId, Priority};
use delivery::DeliveryTask;

/// Default wait between delivery liveness ticks
pub const DEFAULT_DELIVERY_POLL: Duration = Duration::from_secs(1);

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded wait on the egress queue
    pub delivery_poll: Duration,
    /// Whether new sessions start with conversation context enabled
    pub use_context: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            delivery_poll: DEFAULT_DELIVERY_POLL,
            use_context: true,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting submissions and delivering output
    Active,
    /// Closing; already queued output is still written
    Draining,
    /// Delivery finished
    Closed,
}

/// A live connection registered with the broker
pub struct ConnectionSession {
    id: ConnectionId,
    broker: Arc<RequestBroker>,
    pending: Arc<PendingAcks>,
    state: Arc<Mutex<SessionState>>,
    use_context: AtomicBool,
    backend: RwLock<Option<String>>,
    delivery: Mutex<Option<JoinHandle<DeliveryReport>>>,
    connected_at: DateTime<Utc>,
}

impl ConnectionSession {
    /// Register a new connection and start its delivery task
    pub fn open<S: ConnectionSink>(
        broker: Arc<RequestBroker>,
        sink: S,
        config: &SessionConfig,
    ) -> Self {
        Self::open_with_id(ConnectionId::new(), broker, sink, config)
    }

    /// Like [`open`](Self::open) with a caller-chosen id
    pub fn open_with_id<S: ConnectionSink>(
        id: ConnectionId,
        broker: Arc<RequestBroker>,
        sink: S,
        config: &SessionConfig,
    ) -> Self {
        let queue = broker.register_session(id);
        let state = Arc::new(Mutex::new(SessionState::Active));

        let task = DeliveryTask {
            connection_id: id,
            receiver: queue.receiver,
            sink,
            broker: broker.clone(),
            pending: queue.pending.clone(),
            state: state.clone(),
            poll_interval: config.delivery_poll,
        };
        let delivery = tokio::spawn(task.run());

        Self {
            id,
            broker,
            pending: queue.pending,
            state,
            use_context: AtomicBool::new(config.use_context),
            backend: RwLock::new(None),
            delivery: Mutex::new(Some(delivery)),
            connected_at: Utc::now(),
        }
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// When the session was opened
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Turn conversation context on or off for later submissions
    pub fn set_context_enabled(&self, enabled: bool) {
        self.use_context.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.broker.history().clear(self.id);
        }
    }

    /// Whether submissions run against the conversation history
    #[must_use]
    pub fn context_enabled(&self) -> bool {
        self.use_context.load(Ordering::SeqCst)
    }

    /// Select the backend for later submissions (`None` = broker default)
    pub fn set_backend(&self, name: Option<String>) {
        *self.backend.write() = name;
    }

    /// Currently selected backend name
    #[must_use]
    pub fn backend(&self) -> Option<String> {
        self.backend.read().clone()
    }

    /// Turn inbound text into a chat job and submit it
    ///
    /// # Errors
    ///
    /// Propagates [`BrokerError`] from the broker, and reports
    /// `ShuttingDown` once this session is no longer active.
    pub fn submit_chat(
        &self,
        prompt: impl Into<String>,
        priority: Priority,
    ) -> Result<JobId, BrokerError> {
        if self.state() != SessionState::Active {
            return Err(BrokerError::ShuttingDown);
        }

        let history_ref = if self.context_enabled() {
            HistoryRef::Conversation(self.id)
        } else {
            HistoryRef::Fresh
        };
        let mut job = ChatJob::new(self.id, prompt)
            .with_priority(priority)
            .with_history(history_ref);
        job.backend = self.backend();

        self.broker.submit(job)
    }

    /// Register a pending acknowledgement on this connection
    pub fn register_pending(&self, correlation_id: impl Into<String>) -> PendingAck {
        self.pending.register(correlation_id)
    }

    /// Resolve a pending acknowledgement. Unknown or already resolved ids
    /// are ignored and return `false`.
    pub fn resolve_pending(&self, correlation_id: &str, outcome: AckOutcome) -> bool {
        self.pending.resolve(correlation_id, outcome)
    }

    /// Outstanding acknowledgements
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue a connection-level notice behind any pending output
    pub fn notify(&self, level: NoticeLevel, text: impl Into<String>) -> bool {
        self.broker.publish(
            self.id,
            EgressMessage::Notice(Notice {
                level,
                text: text.into(),
            }),
        )
    }

    /// Begin a graceful close. Already queued output is still delivered;
    /// pending acknowledgements are released right away.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Active {
                return;
            }
            *state = SessionState::Draining;
        }
        self.broker.unregister_session(self.id);
        tracing::info!(connection_id = %self.id, "Session closing");
    }

    /// Wait for the delivery task to finish. Returns `None` if it was
    /// already awaited or did not exit cleanly.
    pub async fn closed(&self) -> Option<DeliveryReport> {
        let handle = self.delivery.lock().take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(connection_id = %self.id, error = %e, "Delivery task failed");
                None
            }
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending_acks", &self.pending.len())
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}
