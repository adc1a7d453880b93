//! Per-connection delivery task
//!
//! The delivery task is the only reader of a connection's egress queue.
//! It waits with a bounded timeout so idle connections still get liveness
//! bookkeeping, and it owns disconnect cleanup: on a failed write the
//! session is closed, whatever is still queued is discarded, and every
//! pending acknowledgement is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::broker::RequestBroker;
use crate::event::EgressMessage;
use crate::job::ConnectionId;
use crate::session::pending::{AckOutcome, PendingAcks};
use crate::session::SessionState;

/// Writing to the connection failed
#[derive(Debug, Clone, Error)]
#[error("connection write failed: {0}")]
pub struct SinkError(pub String);

/// Outbound half of a live connection
#[async_trait]
pub trait ConnectionSink: Send + 'static {
    /// Write one message to the connection
    async fn send(&mut self, message: &EgressMessage) -> Result<(), SinkError>;

    /// Whether the peer is known to be gone. Checked on idle ticks.
    fn is_closed(&self) -> bool {
        false
    }
}

/// In-process sink backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EgressMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiver the peer reads from
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EgressMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send(&mut self, message: &EgressMessage) -> Result<(), SinkError> {
        self.tx
            .send(message.clone())
            .map_err(|_| SinkError("peer receiver dropped".into()))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// What a finished delivery task did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Messages written to the connection
    pub delivered: u64,
    /// Messages dropped after the connection failed
    pub discarded: usize,
    /// Receive timeouts with nothing to deliver
    pub idle_ticks: u64,
    /// Whether the task ended because the connection failed
    pub connection_failed: bool,
    /// Acknowledgements released during cleanup
    pub released_acks: usize,
}

pub(crate) struct DeliveryTask<S> {
    pub(crate) connection_id: ConnectionId,
    pub(crate) receiver: mpsc::UnboundedReceiver<EgressMessage>,
    pub(crate) sink: S,
    pub(crate) broker: Arc<RequestBroker>,
    pub(crate) pending: Arc<PendingAcks>,
    pub(crate) state: Arc<Mutex<SessionState>>,
    pub(crate) poll_interval: Duration,
}

impl<S: ConnectionSink> DeliveryTask<S> {
    pub(crate) async fn run(mut self) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut last_activity = Instant::now();

        loop {
            match tokio::time::timeout(self.poll_interval, self.receiver.recv()).await {
                Ok(Some(message)) => {
                    if let Err(e) = self.sink.send(&message).await {
                        tracing::warn!(
                            connection_id = %self.connection_id,
                            error = %e,
                            "Delivery failed, closing session"
                        );
                        self.fail(&mut report);
                        break;
                    }
                    report.delivered += 1;
                    last_activity = Instant::now();
                }
                Ok(None) => {
                    // Every sender is gone: the session was unregistered
                    report.released_acks += self.pending.resolve_all(&AckOutcome::ConnectionClosed);
                    break;
                }
                Err(_) => {
                    report.idle_ticks += 1;
                    if self.sink.is_closed() {
                        tracing::info!(
                            connection_id = %self.connection_id,
                            "Peer gone while idle, closing session"
                        );
                        self.fail(&mut report);
                        break;
                    }
                    tracing::debug!(
                        connection_id = %self.connection_id,
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Delivery idle tick"
                    );
                }
            }
        }

        *self.state.lock() = SessionState::Closed;
        tracing::debug!(
            connection_id = %self.connection_id,
            delivered = report.delivered,
            discarded = report.discarded,
            "Delivery task finished"
        );
        report
    }

    fn fail(&mut self, report: &mut DeliveryReport) {
        report.connection_failed = true;
        *self.state.lock() = SessionState::Closed;

        report.released_acks += self.pending.resolve_all(&AckOutcome::ConnectionClosed);
        self.broker.unregister_session(self.connection_id);
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {
            report.discarded += 1;
        }
    }
}
