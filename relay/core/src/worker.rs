//! Worker Pool
//!
//! A fixed number of loops pull jobs from the broker and run each one in its
//! own task under a hard timeout. Whatever escapes the runner (a backend
//! error, a panic or the timeout) is turned into one final `error` event
//! and the `Failed` state; the loop then moves on to the next job.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::backend::{BackendRegistry, BackendRequest};
use crate::broker::RequestBroker;
use crate::error::JobFailure;
use crate::event::EventMetadata;
use crate::job::{ChatJob, HistoryRef, JobState};
use crate::runner::{JobEmitter, RunOutcome, StreamingRunner};
use crate::tools::ConnectionTools;

/// Default number of concurrent workers
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default hard limit per job
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Default wait for a connection to acknowledge an action
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent workers
    pub worker_count: usize,
    /// Hard limit per job
    pub job_timeout: Duration,
    /// Wait for an action acknowledgement
    pub action_timeout: Duration,
    /// System prompt passed to every backend request
    pub system_prompt: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            system_prompt: None,
        }
    }
}

/// Shared state of every worker loop
struct Worker {
    id: usize,
    broker: Arc<RequestBroker>,
    registry: Arc<BackendRegistry>,
    runner: Arc<StreamingRunner>,
    config: WorkerConfig,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker_id = self.id, "Worker started");
        while let Some(job) = self.broker.next().await {
            self.process(job).await;
        }
        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    async fn process(&self, job: ChatJob) {
        let job_id = job.id;
        let emitter = JobEmitter::new(self.broker.clone(), &job);

        tracing::info!(
            worker_id = self.id,
            job_id = %job_id,
            connection = %job.connection_id,
            priority = job.priority.0,
            "Job started"
        );

        match self.execute(job, &emitter).await {
            Ok(outcome) => {
                self.broker.finish_job(job_id, JobState::Completed);
                tracing::info!(
                    worker_id = self.id,
                    job_id = %job_id,
                    chars = outcome.delivered.chars().count(),
                    attempts = outcome.metadata.attempts,
                    chain_complete = outcome.metadata.chain_complete,
                    "Job completed"
                );
            }
            Err(failure) => {
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job_id,
                    cause = failure.cause(),
                    error = %failure,
                    "Job failed"
                );
                let metadata = EventMetadata {
                    mode: Some(self.runner.config().mode),
                    failure: Some(failure.cause().to_string()),
                    ..EventMetadata::default()
                };
                emitter.error(failure.to_string(), metadata);
                self.broker.finish_job(job_id, JobState::Failed);
            }
        }
    }

    async fn execute(&self, job: ChatJob, emitter: &JobEmitter) -> Result<RunOutcome, JobFailure> {
        let backend = self.registry.resolve(job.backend.as_deref())?;

        let history = match job.history_ref {
            HistoryRef::Fresh => Vec::new(),
            HistoryRef::Conversation(id) => self.broker.history().snapshot(id),
        };
        let tools = Arc::new(ConnectionTools::new(
            self.broker.clone(),
            job.connection_id,
            job.id,
            self.config.action_timeout,
        ));
        let request = BackendRequest::new(job.prompt.clone())
            .with_history(history)
            .with_system(self.config.system_prompt.clone())
            .with_tools(tools);

        let broker = self.broker.clone();
        let runner = self.runner.clone();
        let task_emitter = emitter.clone();
        let mut task = tokio::spawn(async move {
            runner
                .run(&broker, backend.as_ref(), &job, request, &task_emitter)
                .await
        });

        match tokio::time::timeout(self.config.job_timeout, &mut task).await {
            Ok(Ok(result)) => result.map_err(JobFailure::from),
            Ok(Err(join_error)) if join_error.is_panic() => Err(JobFailure::Panicked),
            Ok(Err(_)) => Err(JobFailure::Cancelled),
            Err(_) => {
                // The runner must be gone before the error takes the next sequence
                task.abort();
                match task.await {
                    // Finished before the abort landed
                    Ok(result) => result.map_err(JobFailure::from),
                    Err(_) => Err(JobFailure::Timeout(self.config.job_timeout)),
                }
            }
        }
    }
}

/// Pool of concurrent job workers
pub struct WorkerPool {
    broker: Arc<RequestBroker>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers (at least one)
    #[must_use]
    pub fn start(
        broker: Arc<RequestBroker>,
        registry: Arc<BackendRegistry>,
        runner: Arc<StreamingRunner>,
        config: WorkerConfig,
    ) -> Self {
        let count = config.worker_count.max(1);
        let handles = (0..count)
            .map(|id| {
                let worker = Worker {
                    id,
                    broker: broker.clone(),
                    registry: registry.clone(),
                    runner: runner.clone(),
                    config: config.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(
            workers = count,
            default_backend = registry.default_name(),
            "Worker pool started"
        );
        Self { broker, handles }
    }

    /// Number of worker loops
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Shut the broker down and wait for every worker to finish its job
    pub async fn shutdown(self) {
        self.broker.shutdown();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker loop ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::event::{EgressMessage, EventKind, ResponseEvent};
    use crate::job::ConnectionId;
    use crate::trace::{MessageTrace, TraceEntry};
    use tokio::sync::mpsc;

    async fn final_event(rx: &mut mpsc::UnboundedReceiver<EgressMessage>) -> Vec<ResponseEvent> {
        let mut events = Vec::new();
        while let Some(message) = rx.recv().await {
            if let EgressMessage::Event(event) = message {
                let last = event.is_final;
                events.push(event);
                if last {
                    break;
                }
            }
        }
        events
    }

    fn pool_with(registry: BackendRegistry) -> (Arc<RequestBroker>, WorkerPool) {
        let broker = Arc::new(RequestBroker::default());
        let pool = WorkerPool::start(
            broker.clone(),
            Arc::new(registry),
            Arc::new(StreamingRunner::default()),
            WorkerConfig::default(),
        );
        (broker, pool)
    }

    #[tokio::test]
    async fn test_job_completes() {
        let registry = BackendRegistry::new("echo").with_backend(Arc::new(ScriptedBackend::echo()));
        let (broker, pool) = pool_with(registry);
        let conn = ConnectionId::new();
        let mut queue = broker.register_session(conn);

        let job_id = broker.submit(ChatJob::new(conn, "hello. ")).unwrap();
        let events = final_event(&mut queue.receiver).await;

        assert_eq!(events.last().unwrap().kind, EventKind::Done);
        assert!(events.iter().all(|e| e.job_id == job_id));
        pool.shutdown().await;
        assert_eq!(broker.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_job() {
        let registry = BackendRegistry::new("echo").with_backend(Arc::new(ScriptedBackend::echo()));
        let (broker, pool) = pool_with(registry);
        let conn = ConnectionId::new();
        let mut queue = broker.register_session(conn);

        broker
            .submit(ChatJob::new(conn, "hi").with_backend("missing"))
            .unwrap();
        let events = final_event(&mut queue.receiver).await;

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, EventKind::Error);
        assert_eq!(event.sequence, 0);
        assert_eq!(
            event.metadata.as_ref().unwrap().failure.as_deref(),
            Some("backend")
        );
        pool.shutdown().await;
        assert_eq!(broker.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_conversation_history_reaches_backend() {
        let backend = Arc::new(ScriptedBackend::echo());
        let registry = BackendRegistry::new("echo").with_backend(backend.clone());
        let (broker, pool) = pool_with(registry);
        let conn = ConnectionId::new();
        let mut queue = broker.register_session(conn);

        broker.submit(ChatJob::new(conn, "first").with_conversation()).unwrap();
        final_event(&mut queue.receiver).await;
        broker.submit(ChatJob::new(conn, "second").with_conversation()).unwrap();
        final_event(&mut queue.receiver).await;

        let history = broker.history().snapshot(conn);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], TraceEntry::user("first"));
        assert_eq!(history[3], TraceEntry::assistant("second"));
        pool.shutdown().await;
    }

    /// Batch backend that blocks its thread past the job timeout
    struct StallingBackend;

    #[async_trait::async_trait]
    impl crate::backend::BackendExecutor for StallingBackend {
        fn name(&self) -> &str {
            "stall"
        }

        async fn run_streaming(
            &self,
            _request: &BackendRequest,
        ) -> Result<mpsc::Receiver<crate::backend::StreamingToken>, crate::error::BackendError>
        {
            Err(crate::error::BackendError::NotConfigured("streaming".into()))
        }

        async fn run_batch(
            &self,
            _request: &BackendRequest,
        ) -> Result<crate::backend::BatchOutput, crate::error::BackendError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(crate::backend::BatchOutput::new(
                "Late. Answer.",
                MessageTrace::new(),
            ))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_waits_for_runner_to_stop() {
        let broker = Arc::new(RequestBroker::default());
        let pool = WorkerPool::start(
            broker.clone(),
            Arc::new(BackendRegistry::new("stall").with_backend(Arc::new(StallingBackend))),
            Arc::new(StreamingRunner::new(crate::runner::RunnerConfig {
                mode: crate::runner::RunMode::Batch,
                ..crate::runner::RunnerConfig::default()
            })),
            WorkerConfig {
                worker_count: 1,
                job_timeout: Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        );
        let conn = ConnectionId::new();
        let mut queue = broker.register_session(conn);

        broker.submit(ChatJob::new(conn, "slow")).unwrap();
        let events = final_event(&mut queue.receiver).await;
        pool.shutdown().await;

        // Nothing trails the final event
        while let Ok(message) = queue.receiver.try_recv() {
            assert!(message.as_event().is_none(), "event after final: {message:?}");
        }
        assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..events.len() as u64).collect::<Vec<_>>());
        assert_eq!(broker.stats().completed + broker.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let registry = BackendRegistry::new("s")
            .with_backend(Arc::new(ScriptedBackend::new("s").with_batch("x", MessageTrace::new())));
        let (broker, pool) = pool_with(registry);
        assert_eq!(pool.worker_count(), DEFAULT_WORKER_COUNT);

        pool.shutdown().await;
        assert!(broker.is_shutting_down());
    }
}
