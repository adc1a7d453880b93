//! Request Broker
//!
//! The broker sits between connections and workers:
//!
//! ```text
//!   ConnectionSession ──submit()──▶ ┌──────────────────────────┐ ──next()──▶ Worker 1
//!   ConnectionSession ──submit()──▶ │ ingress (priority, FIFO) │ ──next()──▶ Worker 2
//!                                   └──────────────────────────┘
//!                                   ┌──────────────────────────┐
//!   delivery task ◀──egress queue── │ sessions: conn → sender  │ ◀─publish()─ Worker N
//!                                   └──────────────────────────┘
//! ```
//!
//! Submission never waits: a full ingress queue is reported as
//! [`BrokerError::Backpressure`]. Workers block in [`RequestBroker::next`].
//! Output for an unregistered connection is dropped.
//!
//! The broker also keeps the job ledger and the per-connection history.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use crate::error::{BrokerError, SessionClosedError};
use crate::event::{ActionRequest, EgressMessage};
use crate::history::{HistoryStore, DEFAULT_MAX_TURNS};
use crate::job::{ChatJob, ConnectionId, JobId, JobState, Priority};
use crate::session::pending::{AckOutcome, PendingAcks};
use crate::trace::TraceEntry;

/// Default ingress capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum number of queued (unclaimed) jobs
    pub queue_capacity: usize,
    /// Turns of conversation kept per connection
    pub max_history_turns: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_history_turns: DEFAULT_MAX_TURNS,
        }
    }
}

// ============================================================================
// Ingress queue
// ============================================================================

struct QueuedJob {
    priority: Priority,
    seq: u64,
    job: ChatJob,
}

impl QueuedJob {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

/// Max-heap on (priority, earliest submission)
#[derive(Default)]
struct IngressQueue {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
}

impl IngressQueue {
    fn push(&mut self, job: ChatJob) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob {
            priority: job.priority,
            seq,
            job,
        });
    }

    fn pop(&mut self) -> Option<ChatJob> {
        self.heap.pop().map(|queued| queued.job)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Receiving side handed to a connection's delivery task
#[derive(Debug)]
pub struct EgressQueue {
    /// Connection the queue belongs to
    pub connection_id: ConnectionId,
    /// Single consumer of the connection's egress messages
    pub receiver: mpsc::UnboundedReceiver<EgressMessage>,
    /// The connection's pending acknowledgement table
    pub pending: Arc<PendingAcks>,
}

struct SessionEntry {
    tx: mpsc::UnboundedSender<EgressMessage>,
    pending: Arc<PendingAcks>,
}

/// Snapshot of broker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Jobs waiting in the ingress queue
    pub pending: usize,
    /// Jobs claimed by a worker and not yet terminal
    pub in_flight: usize,
    /// Registered sessions
    pub sessions: usize,
    /// Jobs that reached `Completed`
    pub completed: u64,
    /// Jobs that reached `Failed`
    pub failed: u64,
    /// Submissions refused for backpressure
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

fn new_correlation_id() -> String {
    format!("act-{}", hex::encode(rand::random::<[u8; 6]>()))
}

// ============================================================================
// Broker
// ============================================================================

/// Central job broker. Share it behind an `Arc`.
pub struct RequestBroker {
    config: BrokerConfig,
    queue: Mutex<IngressQueue>,
    available: Notify,
    shutdown: AtomicBool,
    sessions: RwLock<HashMap<ConnectionId, SessionEntry>>,
    jobs: DashMap<JobId, JobState>,
    history: HistoryStore,
    counters: Counters,
}

impl RequestBroker {
    /// Create a broker
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let history = HistoryStore::new(config.max_history_turns);
        Self {
            config,
            queue: Mutex::new(IngressQueue::default()),
            available: Notify::new(),
            shutdown: AtomicBool::new(false),
            sessions: RwLock::new(HashMap::new()),
            jobs: DashMap::new(),
            history,
            counters: Counters::default(),
        }
    }

    /// Broker configuration
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Queue a job without waiting
    ///
    /// # Errors
    ///
    /// [`BrokerError::Backpressure`] when the ingress queue is full,
    /// [`BrokerError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub fn submit(&self, job: ChatJob) -> Result<JobId, BrokerError> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }

        let job_id = job.id;
        let connection_id = job.connection_id;
        let priority = job.priority;
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.queue_capacity {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %connection_id,
                    capacity = self.config.queue_capacity,
                    "Ingress queue full, rejecting job"
                );
                return Err(BrokerError::Backpressure {
                    capacity: self.config.queue_capacity,
                });
            }
            self.jobs.insert(job_id, JobState::Pending);
            queue.push(job);
        }
        self.available.notify_one();

        tracing::debug!(
            job_id = %job_id,
            connection_id = %connection_id,
            priority = priority.0,
            "Job queued"
        );
        Ok(job_id)
    }

    fn try_next(&self) -> Option<ChatJob> {
        let job = self.queue.lock().pop()?;
        self.jobs.insert(job.id, JobState::Executing);
        Some(job)
    }

    /// Wait for the next job. Returns `None` once the broker shuts down.
    pub async fn next(&self) -> Option<ChatJob> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutting_down() {
                return None;
            }
            if let Some(job) = self.try_next() {
                return Some(job);
            }

            notified.await;
        }
    }

    /// Stop accepting jobs, discard queued ones and wake every waiting worker
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let discarded: Vec<ChatJob> = {
            let mut queue = self.queue.lock();
            std::iter::from_fn(|| queue.pop()).collect()
        };
        for job in &discarded {
            self.finish_job(job.id, JobState::Failed);
        }
        self.available.notify_waiters();

        tracing::info!(discarded = discarded.len(), "Broker shutting down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Register a connection and hand back its egress queue
    ///
    /// Registering an id twice replaces the previous egress queue.
    pub fn register_session(&self, id: ConnectionId) -> EgressQueue {
        let (tx, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingAcks::new());

        let previous = self.sessions.write().insert(
            id,
            SessionEntry {
                tx,
                pending: pending.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.pending.resolve_all(&AckOutcome::ConnectionClosed);
            tracing::warn!(connection_id = %id, "Session re-registered, previous queue closed");
        } else {
            tracing::info!(connection_id = %id, "Session registered");
        }

        EgressQueue {
            connection_id: id,
            receiver,
            pending,
        }
    }

    /// Unregister a connection. Its egress sender is dropped, outstanding
    /// acknowledgements resolve as `ConnectionClosed`, and its history is
    /// cleared. Returns `false` if it was not registered.
    pub fn unregister_session(&self, id: ConnectionId) -> bool {
        let entry = self.sessions.write().remove(&id);
        self.history.clear(id);

        match entry {
            Some(entry) => {
                let released = entry.pending.resolve_all(&AckOutcome::ConnectionClosed);
                tracing::info!(
                    connection_id = %id,
                    released_acks = released,
                    "Session unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Whether a connection is registered
    #[must_use]
    pub fn has_session(&self, id: ConnectionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    /// Number of registered sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Queue a message for a connection. Dropped (and `false` returned) if
    /// the connection is not registered.
    pub fn publish(&self, id: ConnectionId, message: impl Into<EgressMessage>) -> bool {
        let message = message.into();
        let sessions = self.sessions.read();
        let delivered = sessions
            .get(&id)
            .is_some_and(|entry| entry.tx.send(message).is_ok());

        if !delivered {
            tracing::debug!(connection_id = %id, "Dropping message for unregistered session");
        }
        delivered
    }

    /// Ask a connection to run `command` and wait for its acknowledgement
    ///
    /// # Errors
    ///
    /// [`SessionClosedError`] if the connection is not registered.
    pub async fn request_action(
        &self,
        id: ConnectionId,
        job_id: JobId,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<AckOutcome, SessionClosedError> {
        let correlation_id = new_correlation_id();
        let (tx, pending) = {
            let sessions = self.sessions.read();
            let entry = sessions.get(&id).ok_or(SessionClosedError(id))?;
            (entry.tx.clone(), entry.pending.clone())
        };

        let ack = pending.register(correlation_id.clone());
        let request = ActionRequest {
            correlation_id: correlation_id.clone(),
            job_id,
            command: command.into(),
        };
        if tx.send(EgressMessage::Action(request)).is_err() {
            pending.resolve(&correlation_id, AckOutcome::ConnectionClosed);
        }

        tracing::debug!(
            connection_id = %id,
            job_id = %job_id,
            correlation_id = %correlation_id,
            "Action requested"
        );
        Ok(ack.wait_timeout(&pending, timeout).await)
    }

    // ------------------------------------------------------------------------
    // Job ledger
    // ------------------------------------------------------------------------

    /// Current state of a job that has not yet reached a terminal state
    #[must_use]
    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        self.jobs.get(&id).map(|state| *state)
    }

    /// Record a non-terminal transition
    pub fn set_job_state(&self, id: JobId, state: JobState) {
        if state.is_terminal() {
            self.finish_job(id, state);
            return;
        }
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            *entry = state;
        }
    }

    /// Record a terminal state and drop the job from the ledger.
    /// Returns `false` if the job was already finished.
    pub fn finish_job(&self, id: JobId, state: JobState) -> bool {
        if self.jobs.remove(&id).is_none() {
            return false;
        }
        match state {
            JobState::Failed => self.counters.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.completed.fetch_add(1, Ordering::Relaxed),
        };
        true
    }

    /// Append a finished job's entries to its connection's history.
    /// Refused (`false`) once the connection is unregistered.
    pub fn append_history(&self, id: ConnectionId, entries: Vec<TraceEntry>) -> bool {
        // Held across the append so unregister_session clears after us
        let sessions = self.sessions.read();
        if !sessions.contains_key(&id) {
            tracing::debug!(connection_id = %id, "Skipping history for unregistered session");
            return false;
        }
        self.history.append(id, entries);
        true
    }

    /// Per-connection history
    #[must_use]
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let pending = self.queue.lock().len();
        BrokerStats {
            pending,
            in_flight: self.jobs.len().saturating_sub(pending),
            sessions: self.session_count(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for RequestBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl std::fmt::Debug for RequestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBroker")
            .field("queue_capacity", &self.config.queue_capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ResponseEvent};
    use std::time::Instant;

    fn broker_with_capacity(queue_capacity: usize) -> RequestBroker {
        RequestBroker::new(BrokerConfig {
            queue_capacity,
            ..BrokerConfig::default()
        })
    }

    fn event(job_id: JobId, sequence: u64) -> ResponseEvent {
        ResponseEvent {
            job_id,
            sequence,
            kind: EventKind::ContentDelta,
            text: format!("chunk-{sequence}"),
            is_final: false,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let broker = broker_with_capacity(10);
        let conn = ConnectionId::from_raw(1);

        let low = broker.submit(ChatJob::new(conn, "low").with_priority(Priority::LOW)).unwrap();
        let first = broker.submit(ChatJob::new(conn, "first")).unwrap();
        let high = broker.submit(ChatJob::new(conn, "high").with_priority(Priority::HIGH)).unwrap();
        let second = broker.submit(ChatJob::new(conn, "second")).unwrap();

        let order: Vec<JobId> = [
            broker.next().await.unwrap().id,
            broker.next().await.unwrap().id,
            broker.next().await.unwrap().id,
            broker.next().await.unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![high, first, second, low]);
    }

    #[test]
    fn test_backpressure_is_immediate() {
        let broker = broker_with_capacity(2);
        let conn = ConnectionId::from_raw(1);

        broker.submit(ChatJob::new(conn, "a")).unwrap();
        broker.submit(ChatJob::new(conn, "b")).unwrap();

        let start = Instant::now();
        let err = broker.submit(ChatJob::new(conn, "c")).unwrap_err();
        assert_eq!(err, BrokerError::Backpressure { capacity: 2 });
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(broker.stats().rejected, 1);
        assert_eq!(broker.stats().pending, 2);
    }

    #[tokio::test]
    async fn test_next_wakes_on_submit() {
        let broker = Arc::new(RequestBroker::default());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next().await.map(|job| job.prompt) })
        };

        tokio::task::yield_now().await;
        broker
            .submit(ChatJob::new(ConnectionId::from_raw(1), "wake"))
            .unwrap();

        let prompt = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prompt.as_deref(), Some("wake"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_workers_and_rejects() {
        let broker = Arc::new(RequestBroker::default());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next().await.is_none() })
        };
        tokio::task::yield_now().await;

        broker.shutdown();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
        assert_eq!(
            broker.submit(ChatJob::new(ConnectionId::from_raw(1), "late")),
            Err(BrokerError::ShuttingDown)
        );
    }

    #[test]
    fn test_shutdown_discards_queued_jobs() {
        let broker = RequestBroker::default();
        let id = broker
            .submit(ChatJob::new(ConnectionId::from_raw(1), "queued"))
            .unwrap();

        broker.shutdown();
        assert_eq!(broker.job_state(id), None);
        assert_eq!(broker.stats().failed, 1);
        assert_eq!(broker.stats().pending, 0);
    }

    #[test]
    fn test_publish_routes_to_registered_session() {
        let broker = RequestBroker::default();
        let a = ConnectionId::from_raw(1);
        let b = ConnectionId::from_raw(2);
        let mut queue_a = broker.register_session(a);
        let mut queue_b = broker.register_session(b);

        let job = JobId::new();
        assert!(broker.publish(a, event(job, 0)));

        let received = queue_a.receiver.try_recv().unwrap();
        assert_eq!(received.as_event().map(|e| e.sequence), Some(0));
        assert!(queue_b.receiver.try_recv().is_err());
    }

    #[test]
    fn test_publish_to_unregistered_is_dropped() {
        let broker = RequestBroker::default();
        let conn = ConnectionId::from_raw(9);
        let mut queue = broker.register_session(conn);
        assert!(broker.unregister_session(conn));

        assert!(!broker.publish(conn, event(JobId::new(), 0)));
        assert!(queue.receiver.try_recv().is_err());
        assert!(!broker.unregister_session(conn));
    }

    #[test]
    fn test_unregister_clears_history() {
        let broker = RequestBroker::default();
        let conn = ConnectionId::from_raw(4);
        let _queue = broker.register_session(conn);
        broker
            .history()
            .append(conn, vec![crate::trace::TraceEntry::user("hi")]);
        assert_eq!(broker.history().len(conn), 1);

        broker.unregister_session(conn);
        assert!(broker.history().snapshot(conn).is_empty());
    }

    #[test]
    fn test_history_refused_after_unregister() {
        let broker = RequestBroker::default();
        let conn = ConnectionId::from_raw(8);
        let _queue = broker.register_session(conn);
        assert!(broker.append_history(conn, vec![crate::trace::TraceEntry::user("hi")]));
        assert_eq!(broker.history().len(conn), 1);

        broker.unregister_session(conn);
        assert!(!broker.append_history(conn, vec![crate::trace::TraceEntry::user("late")]));
        assert_eq!(broker.history().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_request_action_round_trip() {
        let broker = Arc::new(RequestBroker::default());
        let conn = ConnectionId::from_raw(5);
        let mut queue = broker.register_session(conn);
        let job = JobId::new();

        let requester = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request_action(conn, job, "/time set day", Duration::from_secs(5))
                    .await
            })
        };

        let request = match queue.receiver.recv().await {
            Some(EgressMessage::Action(request)) => request,
            other => panic!("expected action request, got {other:?}"),
        };
        assert_eq!(request.command, "/time set day");
        assert_eq!(request.job_id, job);
        assert!(queue
            .pending
            .resolve(&request.correlation_id, AckOutcome::Success("done".into())));

        let outcome = requester.await.unwrap().unwrap();
        assert_eq!(outcome, AckOutcome::Success("done".into()));
    }

    #[tokio::test]
    async fn test_request_action_on_missing_session() {
        let broker = RequestBroker::default();
        let conn = ConnectionId::from_raw(6);
        let err = broker
            .request_action(conn, JobId::new(), "noop", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, SessionClosedError(conn));
    }

    #[tokio::test]
    async fn test_aborted_action_removes_pending_entry() {
        let broker = Arc::new(RequestBroker::default());
        let conn = ConnectionId::from_raw(10);
        let mut queue = broker.register_session(conn);

        let requester = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request_action(conn, JobId::new(), "/weather clear", Duration::from_secs(60))
                    .await
            })
        };
        let _ = queue.receiver.recv().await;
        assert_eq!(queue.pending.len(), 1);

        requester.abort();
        let _ = requester.await;
        assert!(queue.pending.is_empty());
        assert!(broker.has_session(conn));
    }

    #[tokio::test]
    async fn test_unregister_releases_pending_action() {
        let broker = Arc::new(RequestBroker::default());
        let conn = ConnectionId::from_raw(7);
        let mut queue = broker.register_session(conn);

        let requester = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request_action(conn, JobId::new(), "/say hi", Duration::from_secs(30))
                    .await
            })
        };
        let _ = queue.receiver.recv().await;
        broker.unregister_session(conn);

        let outcome = tokio::time::timeout(Duration::from_secs(1), requester)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, AckOutcome::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_ledger_transitions() {
        let broker = RequestBroker::default();
        let id = broker
            .submit(ChatJob::new(ConnectionId::from_raw(1), "x"))
            .unwrap();
        assert_eq!(broker.job_state(id), Some(JobState::Pending));

        let job = broker.next().await.unwrap();
        assert_eq!(broker.job_state(job.id), Some(JobState::Executing));
        assert_eq!(broker.stats().in_flight, 1);

        broker.set_job_state(id, JobState::Incomplete);
        assert_eq!(broker.job_state(id), Some(JobState::Incomplete));

        assert!(broker.finish_job(id, JobState::Completed));
        assert!(!broker.finish_job(id, JobState::Failed));
        assert_eq!(broker.stats().completed, 1);
        assert_eq!(broker.stats().failed, 0);
    }
}
