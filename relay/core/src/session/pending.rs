//! Pending acknowledgement table
//!
//! Each entry is a oneshot sender keyed by correlation id. Resolving removes
//! the entry, so every future is completed exactly once: by an inbound
//! acknowledgement, by its timeout, or by disconnect cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// How an action round-trip ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum AckOutcome {
    /// The connection carried out the command
    Success(String),
    /// The connection reported a failure
    Failure(String),
    /// The connection went away before acknowledging
    ConnectionClosed,
    /// No acknowledgement arrived in time
    TimedOut,
}

impl AckOutcome {
    /// Whether the command succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Future side of a pending acknowledgement
#[derive(Debug)]
pub struct PendingAck {
    correlation_id: String,
    rx: oneshot::Receiver<AckOutcome>,
}

impl PendingAck {
    /// Correlation id this future waits on
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait at most `timeout`. On expiry the entry is resolved as
    /// [`AckOutcome::TimedOut`] through `table`; if an acknowledgement won
    /// the race, that outcome is returned instead. Dropping the future
    /// before it finishes removes the entry.
    pub async fn wait_timeout(mut self, table: &PendingAcks, timeout: Duration) -> AckOutcome {
        let _guard = DiscardOnDrop {
            table,
            correlation_id: &self.correlation_id,
        };
        match tokio::time::timeout(timeout, &mut self.rx).await {
            // A dropped sender means cleanup released the entry
            Ok(result) => result.unwrap_or(AckOutcome::ConnectionClosed),
            Err(_) => {
                table.resolve(&self.correlation_id, AckOutcome::TimedOut);
                self.rx.await.unwrap_or(AckOutcome::TimedOut)
            }
        }
    }
}

/// Removes an abandoned waiter's entry from its table
struct DiscardOnDrop<'a> {
    table: &'a PendingAcks,
    correlation_id: &'a str,
}

impl Drop for DiscardOnDrop<'_> {
    fn drop(&mut self) {
        self.table.discard(self.correlation_id);
    }
}

impl Future for PendingAck {
    type Output = AckOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(AckOutcome::ConnectionClosed))
    }
}

/// Table of outstanding acknowledgements for one connection
#[derive(Debug, Default)]
pub struct PendingAcks {
    entries: Mutex<HashMap<String, oneshot::Sender<AckOutcome>>>,
    closed: AtomicBool,
}

impl PendingAcks {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a correlation id. After the table has been closed the
    /// returned future is already resolved with `ConnectionClosed`.
    pub fn register(&self, correlation_id: impl Into<String>) -> PendingAck {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();

        let mut entries = self.entries.lock();
        if self.closed.load(Ordering::SeqCst) {
            let _ = tx.send(AckOutcome::ConnectionClosed);
        } else if let Some(previous) = entries.insert(correlation_id.clone(), tx) {
            tracing::warn!(
                correlation_id = %correlation_id,
                "Correlation id reused, releasing previous waiter"
            );
            let _ = previous.send(AckOutcome::ConnectionClosed);
        }

        PendingAck { correlation_id, rx }
    }

    /// Resolve one entry. Returns `false` for unknown or already resolved ids.
    pub fn resolve(&self, correlation_id: &str, outcome: AckOutcome) -> bool {
        let sender = self.entries.lock().remove(correlation_id);
        match sender {
            Some(tx) => {
                // A dropped receiver still counts as resolved
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    "Acknowledgement for unknown or resolved id ignored"
                );
                false
            }
        }
    }

    /// Drop an entry without resolving it. No-op for unknown ids.
    fn discard(&self, correlation_id: &str) {
        if self.entries.lock().remove(correlation_id).is_some() {
            tracing::debug!(
                correlation_id = %correlation_id,
                "Waiter abandoned, pending entry removed"
            );
        }
    }

    /// Resolve every entry with the same outcome and refuse new ones.
    /// Returns how many entries were released.
    pub fn resolve_all(&self, outcome: &AckOutcome) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            self.closed.store(true, Ordering::SeqCst);
            entries.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(outcome.clone());
        }
        count
    }

    /// Number of unresolved entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table has been closed by disconnect cleanup
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
