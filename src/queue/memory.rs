//! In-process task queue.
//!
//! [`InMemoryQueue`] keeps task records in a [`DashMap`] and the waiting line
//! in a `VecDeque` behind a `parking_lot` mutex. Nothing survives the
//! process; it backs the tests and local demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{QueueState, QueuedTask, TaskQueue, TaskRequest};
use crate::error::QueueError;
use crate::types::{Task, TaskOutcome};

/// Thread-safe in-memory [`TaskQueue`].
///
/// # Examples
///
/// ```
/// use cancelable_worker::queue::{InMemoryQueue, QueueState, TaskQueue, TaskRequest};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let queue = InMemoryQueue::new();
/// let task = queue.enqueue(TaskRequest::demo()).await.unwrap();
/// assert_eq!(task.id(), "1");
/// assert_eq!(queue.state("1").await.unwrap(), QueueState::Waiting);
/// # });
/// ```
#[derive(Debug)]
pub struct InMemoryQueue {
    next_id: AtomicU64,
    waiting: Mutex<VecDeque<String>>,
    tasks: DashMap<String, QueuedTask>,
}

impl InMemoryQueue {
    /// Creates an empty queue; the first id issued is `"1"`.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(VecDeque::new()),
            tasks: DashMap::new(),
        }
    }

    /// Number of tasks still waiting.
    pub fn waiting_len(&self) -> usize {
        self.waiting.lock().len()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_key(id: &str) -> (u64, String) {
    (id.parse().unwrap_or(u64::MAX), id.to_string())
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, request: TaskRequest) -> Result<Task, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let task = request.into_task(id.clone());
        self.tasks.insert(
            id.clone(),
            QueuedTask {
                task: task.clone(),
                state: QueueState::Waiting,
                outcome: None,
            },
        );
        self.waiting.lock().push_back(id);
        Ok(task)
    }

    async fn next(&self) -> Result<Option<Task>, QueueError> {
        let Some(id) = self.waiting.lock().pop_front() else {
            return Ok(None);
        };
        let mut entry = self.tasks.get_mut(&id).ok_or_else(|| QueueError::Corrupt {
            task_id: id.clone(),
            message: "waiting id has no task record".to_string(),
        })?;
        entry.state = QueueState::Active;
        Ok(Some(entry.task.clone()))
    }

    async fn acknowledge(&self, outcome: &TaskOutcome) -> Result<(), QueueError> {
        let mut entry = self
            .tasks
            .get_mut(outcome.task_id())
            .ok_or_else(|| QueueError::NotFound {
                task_id: outcome.task_id().to_string(),
            })?;
        entry.state = QueueState::from_outcome(outcome.status());
        entry.outcome = Some(outcome.clone());
        Ok(())
    }

    async fn state(&self, task_id: &str) -> Result<QueueState, QueueError> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.state)
            .ok_or_else(|| QueueError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<QueuedTask>, QueueError> {
        let mut tasks: Vec<QueuedTask> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by_key(|t| sort_key(t.task.id()));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::TaskError;
    use crate::types::OutcomeStatus;

    #[tokio::test]
    async fn ids_increase_and_next_is_fifo() {
        let queue = InMemoryQueue::new();
        let a = queue.enqueue(TaskRequest::demo()).await.unwrap();
        let b = queue.enqueue(TaskRequest::demo()).await.unwrap();
        assert_eq!((a.id(), b.id()), ("1", "2"));

        assert_eq!(queue.next().await.unwrap().unwrap().id(), "1");
        assert_eq!(queue.state("1").await.unwrap(), QueueState::Active);
        assert_eq!(queue.state("2").await.unwrap(), QueueState::Waiting);
        assert_eq!(queue.next().await.unwrap().unwrap().id(), "2");
        assert!(queue.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acknowledge_records_terminal_state() {
        let queue = InMemoryQueue::new();
        for _ in 0..3 {
            queue.enqueue(TaskRequest::demo()).await.unwrap();
        }
        let err = TaskError::Termination {
            message: "kill failed".to_string(),
        };
        queue
            .acknowledge(&TaskOutcome::new("1", OutcomeStatus::Finished, Some(0), None))
            .await
            .unwrap();
        queue
            .acknowledge(&TaskOutcome::new("2", OutcomeStatus::CancelledWithError, None, Some(err)))
            .await
            .unwrap();

        let states: Vec<_> = queue.list().await.unwrap().into_iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![QueueState::Completed, QueueState::Cancelled, QueueState::Waiting]
        );
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let queue = InMemoryQueue::new();
        assert!(matches!(queue.state("9").await, Err(QueueError::NotFound { .. })));
        let outcome = TaskOutcome::new("9", OutcomeStatus::Finished, Some(0), None);
        assert!(matches!(queue.acknowledge(&outcome).await, Err(QueueError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_orders_numerically() {
        let queue = InMemoryQueue::new();
        for _ in 0..11 {
            queue.enqueue(TaskRequest::demo()).await.unwrap();
        }
        let ids: Vec<String> = queue
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task.id().to_string())
            .collect();
        assert_eq!(ids.first().map(String::as_str), Some("1"));
        assert_eq!(ids.last().map(String::as_str), Some("11"));
    }
}
