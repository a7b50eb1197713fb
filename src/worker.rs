//! Bounded-concurrency worker loop.
//!
//! [`Worker::run`] claims tasks from a [`TaskQueue`] while a semaphore permit
//! is free, runs each through [`TaskExecutor::execute_task`] on its own tokio
//! task, and acknowledges the outcome. When the shutdown token fires it
//! stops claiming and waits for in-flight tasks to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{DEFAULT_CONCURRENCY, DEFAULT_POLL_INTERVAL_MS};
use crate::executor::TaskExecutor;
use crate::queue::TaskQueue;
use crate::types::Task;

/// Pulls tasks from a queue and executes them.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use cancelable_worker::channel::{ChannelRouter, InMemoryTransport};
/// use cancelable_worker::queue::InMemoryQueue;
/// use cancelable_worker::runtime::ScriptedRuntime;
/// use cancelable_worker::{TaskExecutor, Worker};
///
/// let (transport, inbound) = InMemoryTransport::new();
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let router = ChannelRouter::spawn(Arc::new(transport), inbound);
/// let executor = Arc::new(TaskExecutor::new(Arc::new(ScriptedRuntime::new()), router));
/// let worker = Worker::new(Arc::new(InMemoryQueue::new()), executor)
///     .with_concurrency(4)
///     .with_poll_interval(Duration::from_millis(100));
/// assert_eq!(worker.concurrency(), 4);
/// # });
/// ```
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    executor: Arc<TaskExecutor>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Worker {
    /// Creates a worker with the default concurrency and poll interval.
    pub fn new(queue: Arc<dyn TaskQueue>, executor: Arc<TaskExecutor>) -> Self {
        Self {
            queue,
            executor,
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    /// Sets the maximum number of tasks running at once (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets how long to wait before polling an empty queue again.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Maximum number of tasks running at once.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The executor tasks are run on.
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Runs until `shutdown` is cancelled, then drains in-flight tasks.
    ///
    /// Returns the number of tasks claimed.
    pub async fn run(&self, shutdown: CancellationToken) -> usize {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        let mut claimed = 0usize;

        info!(concurrency = self.concurrency, "worker started");
        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }

            // Not raced against shutdown: a claimed task must not be lost.
            match self.queue.next().await {
                Ok(Some(task)) => {
                    claimed += 1;
                    debug!(task_id = task.id(), "claimed task");
                    in_flight.spawn(process(
                        Arc::clone(&self.queue),
                        Arc::clone(&self.executor),
                        task,
                        permit,
                    ));
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "failed to claim task");
                    self.idle(&shutdown).await;
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "task panicked");
                }
            }
        }

        info!(in_flight = in_flight.len(), "worker stopping; draining in-flight tasks");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task panicked");
            }
        }
        info!(claimed, "worker stopped");
        claimed
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("concurrency", &self.concurrency)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

async fn process(
    queue: Arc<dyn TaskQueue>,
    executor: Arc<TaskExecutor>,
    task: Task,
    _permit: OwnedSemaphorePermit,
) {
    let outcome = executor.execute_task(&task).await;
    if let Some(err) = outcome.error() {
        warn!("Task {} failed: {}", task.id(), err);
    }
    if let Err(e) = queue.acknowledge(&outcome).await {
        error!(task_id = task.id(), error = %e, "failed to acknowledge outcome");
    }
}
